//! Cross-wired devices and the handler that completes their work.

use crate::{
    config::{Pairing, MAX_TIMEOUT},
    device::{Census, Endpoint, InFlight, Stats},
    frame::{self, Address},
    interrupt::{Message, Status},
    metrics::Metrics,
    pool::Owner,
    watchdog::{Timers, Watchdog},
    Config, Deliver, Device, Error, Transmit,
};
use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::VecDeque,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    select,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace, warn};

/// Prefix applied to every metric registered by the engine.
const METRICS_PREFIX: &str = "loopback";

struct Shared {
    devices: Vec<Endpoint>,
    pairing: Pairing,
    timeout: Duration,
    lockup: Option<NonZeroU64>,
    rewrite: bool,
    closed: AtomicBool,
}

impl Shared {
    fn endpoint(&self, device: Device) -> Result<&Endpoint, Error> {
        self.devices
            .get(device.index())
            .ok_or(Error::UnknownDevice(device.index()))
    }
}

/// Handle to a set of cross-wired devices.
///
/// Cloning the engine is cheap and every clone refers to the same devices. All operations are
/// synchronous and never wait on the [Handler].
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    mailbox: mpsc::UnboundedSender<Message>,
}

impl Engine {
    /// Create the devices described by `cfg`, each with a full pool.
    ///
    /// The returned [Handler] must be run for completions and deliveries to occur.
    pub fn new(cfg: Config) -> Result<(Self, Handler), Error> {
        if cfg.pool_size == 0 {
            return Err(Error::EmptyPool);
        }
        if cfg.timeout > MAX_TIMEOUT {
            return Err(Error::InvalidTimeout(cfg.timeout));
        }
        let pairing = Pairing::new(&cfg.peers)?;
        let metrics = {
            let mut registry = cfg.registry.lock().unwrap();
            Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX))
        };
        let devices = (0..pairing.len())
            .map(Device::new)
            .map(|device| Endpoint::new(device, cfg.pool_size, metrics.counters(device)))
            .collect();
        debug!(
            devices = pairing.len(),
            pool_size = cfg.pool_size,
            timeout = ?cfg.timeout,
            "created devices"
        );

        let shared = Arc::new(Shared {
            devices,
            pairing,
            timeout: cfg.timeout,
            lockup: cfg.lockup,
            rewrite: cfg.rewrite,
            closed: AtomicBool::new(false),
        });
        let (sender, receiver) = mpsc::unbounded();
        Ok((
            Self {
                shared: shared.clone(),
                mailbox: sender,
            },
            Handler {
                shared,
                mailbox: receiver,
                backlog: VecDeque::new(),
                timers: Timers::new(),
            },
        ))
    }

    /// Iterate over every device.
    pub fn devices(&self) -> impl Iterator<Item = Device> {
        (0..self.shared.devices.len()).map(Device::new)
    }

    /// Device cross-wired to `device`.
    pub fn peer(&self, device: Device) -> Result<Device, Error> {
        self.shared.endpoint(device)?;
        Ok(self.shared.pairing.peer(device))
    }

    /// Assign the device its hardware address and start accepting submissions.
    pub fn open(&self, device: Device) -> Result<(), Error> {
        let endpoint = self.shared.endpoint(device)?;
        let mut state = endpoint.lock();
        state.address = Address::for_index(device.index());
        state.ready = true;
        debug!(%device, address = %state.address, "opened device");
        Ok(())
    }

    /// Stop accepting submissions.
    ///
    /// Transmissions already accepted still complete (or time out).
    pub fn close(&self, device: Device) -> Result<(), Error> {
        let endpoint = self.shared.endpoint(device)?;
        endpoint.lock().ready = false;
        debug!(%device, "closed device");
        Ok(())
    }

    /// Enable or disable receive interrupts.
    ///
    /// While disabled, received frames accumulate on the queue. Enabling with frames queued
    /// raises a receive interrupt immediately.
    pub fn set_receive_interrupts(&self, device: Device, enabled: bool) -> Result<(), Error> {
        let endpoint = self.shared.endpoint(device)?;
        let fire = {
            let mut state = endpoint.lock();
            state.rx_interrupts = enabled;
            enabled && state.has_queued() && state.line.raise(Status::RX)
        };
        if fire {
            self.fire(device);
        }
        Ok(())
    }

    /// Transmit `frame` from `device` to its peer.
    ///
    /// Frames shorter than [frame::MIN_FRAME_LEN] are zero-padded. Returns
    /// [Transmit::Blocked] if the device has no buffer to track the transmission, in which case
    /// nothing is sent and the caller should wait for [Engine::unblocked] before retrying. If
    /// the peer has no buffer to receive the frame, it is counted as dropped by the peer and the
    /// transmission is still [Transmit::Accepted].
    pub fn transmit(&self, device: Device, frame: &[u8]) -> Result<Transmit, Error> {
        let sender = self.shared.endpoint(device)?;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let frame = frame::pad(frame)?;

        // Reserve a buffer to track the transmission
        let (seq, lost) = {
            let mut state = sender.lock();

            // Shutdown may have reclaimed this device already
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if !state.ready {
                debug!(%device, "device not ready, dropping frame");
                return Ok(Transmit::Dropped);
            }
            let Some(slot) = state.acquire(Owner::InFlight) else {
                return Ok(Transmit::Blocked);
            };
            state.write(slot, &frame);
            let started = Instant::now();
            state.submitted += 1;
            let seq = state.submitted;
            state.in_flight.push_back(InFlight {
                seq,
                slot,
                len: frame.len(),
                started,
                signaled: false,
            });
            let lost = self
                .shared
                .lockup
                .is_some_and(|every| seq % every.get() == 0);
            if state.watchdog.start() {
                self.send(Message::Watch {
                    device,
                    deadline: started + self.shared.timeout,
                });
            }
            (seq, lost)
        };

        // Hand a copy to the peer
        let peer = self.shared.pairing.peer(device);
        let receiver = &self.shared.devices[peer.index()];
        let fire = {
            let mut state = receiver.lock();
            let closed = self.shared.closed.load(Ordering::Acquire);
            let copy = if closed {
                None
            } else {
                state.acquire(Owner::Queue)
            };
            match copy {
                Some(copy) => {
                    state.write(copy, &frame);
                    if self.shared.rewrite && frame::rewrite(state.frame_mut(copy)) {
                        trace!(%device, %peer, "rewrote addresses");
                    }
                    state.enqueue(copy);
                    state.rx_interrupts && state.line.raise(Status::RX)
                }
                None => {
                    state.dropped();
                    let reason = if closed { "closed" } else { "pool exhausted" };
                    debug!(%device, %peer, reason, "dropping frame");
                    false
                }
            }
        };
        if fire {
            self.fire(peer);
        }

        // Raise the completion on the sender
        if lost {
            debug!(%device, "suppressing transmit completion");
            return Ok(Transmit::Accepted);
        }
        let fire = {
            let mut state = sender.lock();
            state.signal(seq) && state.line.raise(Status::TX)
        };
        if fire {
            self.fire(device);
        }
        Ok(Transmit::Accepted)
    }

    /// Build a frame from `device` to its peer.
    pub fn compose(&self, device: Device, ethertype: u16, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let source = self.address(device)?;
        let destination = self.address(self.peer(device)?)?;
        Ok(frame::compose(destination, source, ethertype, payload))
    }

    /// Wait for the next release that unblocks `device`.
    ///
    /// Each unblock wakes exactly one waiter. An unblock with no waiter is remembered, so a caller
    /// that observed [Transmit::Blocked] never misses the release that follows. Wakeups may be
    /// stale, so callers should retry and wait again if still blocked.
    pub async fn unblocked(&self, device: Device) -> Result<(), Error> {
        let endpoint = self.shared.endpoint(device)?;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        endpoint.unblocked.notified().await;
        Ok(())
    }

    /// Snapshot the statistics of `device`.
    pub fn stats(&self, device: Device) -> Result<Stats, Error> {
        Ok(self.shared.endpoint(device)?.lock().stats())
    }

    /// Account for every buffer of `device`.
    pub fn census(&self, device: Device) -> Result<Census, Error> {
        Ok(self.shared.endpoint(device)?.lock().census())
    }

    /// Hardware address of `device` ([Address::ZERO] until opened).
    pub fn address(&self, device: Device) -> Result<Address, Error> {
        Ok(self.shared.endpoint(device)?.lock().address)
    }

    /// Whether `device` accepts submissions.
    pub fn is_ready(&self, device: Device) -> Result<bool, Error> {
        Ok(self.shared.endpoint(device)?.lock().ready)
    }

    /// Whether the pool of `device` is exhausted.
    pub fn is_blocked(&self, device: Device) -> Result<bool, Error> {
        Ok(self.shared.endpoint(device)?.lock().is_blocked())
    }

    /// Watchdog state of `device`.
    pub fn watchdog(&self, device: Device) -> Result<Watchdog, Error> {
        Ok(self.shared.endpoint(device)?.lock().watchdog)
    }

    /// Close every device, return all queued and in-flight buffers to their pools, and stop the
    /// [Handler].
    ///
    /// Returns the number of buffers reclaimed. Buffers being delivered when this is called are
    /// returned once the upper layer finishes with them.
    pub fn shutdown(&self) -> usize {
        self.shared.closed.store(true, Ordering::Release);
        let mut reclaimed = 0;
        for endpoint in &self.shared.devices {
            {
                let mut state = endpoint.lock();
                state.ready = false;
                state.line.take();
                reclaimed += state.reclaim().0;
            }
            endpoint.unblocked.notify_waiters();
        }
        self.mailbox.close_channel();
        debug!(reclaimed, "shut down");
        reclaimed
    }

    fn fire(&self, device: Device) {
        self.send(Message::Fire(device));
    }

    fn send(&self, message: Message) {
        if let Err(err) = self.mailbox.unbounded_send(message) {
            debug!(?err, "handler stopped");
        }
    }
}

/// Consumer of firings and watchdog deadlines.
///
/// All completions, deliveries, and recoveries happen on the task running [Handler::run].
pub struct Handler {
    shared: Arc<Shared>,
    mailbox: mpsc::UnboundedReceiver<Message>,
    backlog: VecDeque<Device>,
    timers: Timers<Device>,
}

enum Work {
    Message(Option<Message>),
    Expired,
}

impl Handler {
    /// Process firings and deadlines until the engine is shut down or every [Engine] is dropped.
    ///
    /// Frames are handed to `deliver` without any device lock held, so `deliver` may transmit.
    pub async fn run(mut self, mut deliver: impl Deliver) {
        loop {
            // Interrupts re-raised while handling a firing are served before new work
            if let Some(device) = self.backlog.pop_front() {
                self.fire(device, &mut deliver);
                continue;
            }

            let next = self.timers.next();
            let work = select! {
                message = self.mailbox.next() => Work::Message(message),
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    Work::Expired
                }
            };
            match work {
                Work::Message(Some(Message::Fire(device))) => self.fire(device, &mut deliver),
                Work::Message(Some(Message::Watch { device, deadline })) => {
                    self.timers.schedule(device, deadline);
                }
                Work::Message(None) => break,
                Work::Expired => {
                    let now = Instant::now();
                    let mut expired = Vec::new();
                    while let Some(device) = self.timers.pop_expired(now) {
                        expired.push(device);
                    }
                    for device in expired {
                        self.expire(device);
                    }
                }
            }
        }
        debug!("handler stopped");
    }

    /// Handle every cause latched on `device`.
    fn fire(&mut self, device: Device, deliver: &mut impl Deliver) {
        let shared = self.shared.clone();
        let endpoint = &shared.devices[device.index()];
        let (delivery, unblocked) = {
            let mut state = endpoint.lock();
            let status = state.line.take();
            let mut delivery = None;
            let mut unblocked = false;

            if status.contains(Status::RX) {
                if let Some(slot) = state.dequeue() {
                    let frame = Bytes::copy_from_slice(state.frame(slot));
                    state.received(frame.len());
                    delivery = Some((slot, frame));
                }
                if state.rx_interrupts && state.has_queued() && state.line.raise(Status::RX) {
                    self.backlog.push_back(device);
                }
            }

            if status.contains(Status::TX) && state.oldest_signaled() {
                if let Some(record) = state.in_flight.pop_front() {
                    let latency = record.started.elapsed();
                    trace!(%device, ?latency, "transmit complete");
                    state.transmitted(record.len);
                    unblocked = state.release(record.slot, Owner::InFlight);
                }
                // The next record keeps the deadline of its own submission
                let next = state
                    .in_flight
                    .front()
                    .map(|record| record.started + shared.timeout);
                match next {
                    Some(deadline) => self.timers.schedule(device, deadline),
                    None => {
                        state.watchdog = Watchdog::Idle;
                        self.timers.cancel(&device);
                    }
                }
                if state.oldest_signaled() && state.line.raise(Status::TX) {
                    self.backlog.push_back(device);
                }
            }
            (delivery, unblocked)
        };
        if unblocked {
            endpoint.unblocked.notify_one();
        }

        // Deliver without holding the lock so the upper layer may transmit
        if let Some((slot, frame)) = delivery {
            deliver.deliver(device, frame);
            if endpoint.lock().delivered(slot) {
                endpoint.unblocked.notify_one();
            }
        }
    }

    /// Recover the oldest transmission of `device` if it missed its deadline.
    fn expire(&mut self, device: Device) {
        let shared = self.shared.clone();
        let endpoint = &shared.devices[device.index()];
        let now = Instant::now();
        let unblocked = {
            let mut state = endpoint.lock();
            let Some((signaled, started)) = state
                .in_flight
                .front()
                .map(|record| (record.signaled, record.started))
            else {
                state.watchdog = Watchdog::Idle;
                return;
            };
            if signaled {
                // The completion is already latched, so only push the deadline back
                if state.line.raise(Status::TX) {
                    self.backlog.push_back(device);
                }
                self.timers.schedule(device, now + shared.timeout);
                return;
            }
            let deadline = started + shared.timeout;
            if deadline > now {
                // Armed for a transmission that already completed
                self.timers.schedule(device, deadline);
                return;
            }

            state.watchdog = Watchdog::TimedOut;
            let Some(record) = state.in_flight.pop_front() else {
                return;
            };
            let latency = now - record.started;
            warn!(%device, ?latency, "transmit timeout");
            state.timed_out();
            let unblocked = state.release(record.slot, Owner::InFlight);
            let next = state
                .in_flight
                .front()
                .map(|record| record.started + shared.timeout);
            if let Some(deadline) = next {
                state.watchdog = Watchdog::Transmitting;
                self.timers.schedule(device, deadline);
                if state.oldest_signaled() && state.line.raise(Status::TX) {
                    self.backlog.push_back(device);
                }
            } else {
                state.watchdog = Watchdog::Idle;
            }
            unblocked
        };
        if unblocked {
            endpoint.unblocked.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{pairs, DEFAULT_POOL_SIZE, DEFAULT_TIMEOUT},
        frame::{Header, ETHERTYPE_IPV4, HEADER_LEN, MIN_FRAME_LEN},
    };
    use futures::{channel::mpsc::UnboundedReceiver, FutureExt};
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, timeout};

    type Delivered = UnboundedReceiver<(Device, Bytes)>;

    fn traced() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    /// Create an engine, run its handler, and open every device.
    fn start(cfg: Config) -> (Engine, Delivered) {
        traced();
        let (engine, handler) = Engine::new(cfg).unwrap();
        let (sender, receiver) = mpsc::unbounded();
        tokio::spawn(handler.run(move |device: Device, frame: Bytes| {
            let _ = sender.unbounded_send((device, frame));
        }));
        for device in engine.devices() {
            engine.open(device).unwrap();
        }
        (engine, receiver)
    }

    /// Let the handler drain everything that does not depend on a deadline.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn tag(frame: &[u8]) -> u8 {
        frame[HEADER_LEN]
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_scenario() {
        let (engine, mut delivered) = start(Config {
            pool_size: 2,
            ..Default::default()
        });
        let (a, b) = (Device::new(0), Device::new(1));
        let frames: Vec<_> = (1..=3u8)
            .map(|i| engine.compose(a, ETHERTYPE_IPV4, &[i]).unwrap())
            .collect();

        // The first two packets exhaust the sender's pool
        assert_eq!(engine.transmit(a, &frames[0]).unwrap(), Transmit::Accepted);
        assert_eq!(engine.transmit(a, &frames[1]).unwrap(), Transmit::Accepted);
        assert!(engine.is_blocked(a).unwrap());
        assert_eq!(engine.transmit(a, &frames[2]).unwrap(), Transmit::Blocked);
        let census = engine.census(a).unwrap();
        assert_eq!(census.in_flight, 2);
        assert_eq!(census.free, 0);
        assert_eq!(engine.census(b).unwrap().queued, 2);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Transmitting);

        // The first completion releases a buffer
        engine.unblocked(a).await.unwrap();
        assert!(engine.stats(a).unwrap().tx_packets >= 1);
        assert_eq!(engine.transmit(a, &frames[2]).unwrap(), Transmit::Accepted);
        settle().await;

        // Packets arrive in submission order
        for (i, frame) in frames.iter().enumerate() {
            let (device, received) = delivered.next().await.unwrap();
            assert_eq!(device, b);
            assert_eq!(received.len(), MIN_FRAME_LEN);
            assert_eq!(&received[..frame.len()], &frame[..]);
            assert_eq!(tag(&received), i as u8 + 1);
            let header = Header::parse(&received).unwrap();
            assert_eq!(header.source, engine.address(a).unwrap());
            assert_eq!(header.destination, engine.address(b).unwrap());
        }

        let stats = engine.stats(a).unwrap();
        assert_eq!(stats.tx_packets, 3);
        assert_eq!(stats.tx_bytes, 3 * MIN_FRAME_LEN as u64);
        assert_eq!(stats.tx_errors, 0);
        let stats = engine.stats(b).unwrap();
        assert_eq!(stats.rx_packets, 3);
        assert_eq!(stats.rx_bytes, 3 * MIN_FRAME_LEN as u64);
        assert_eq!(stats.rx_dropped, 0);
        for device in [a, b] {
            let census = engine.census(device).unwrap();
            assert_eq!(census.free, 2);
            assert!(census.is_conserved());
            assert!(!engine.is_blocked(device).unwrap());
        }
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_recovers_lost_completion() {
        let (engine, mut delivered) = start(Config {
            pool_size: 4,
            lockup: NonZeroU64::new(2),
            ..Default::default()
        });
        let (a, b) = (Device::new(0), Device::new(1));
        let frame = engine.compose(a, ETHERTYPE_IPV4, &[0; 64]).unwrap();

        // The second completion is never raised
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        settle().await;
        let stats = engine.stats(a).unwrap();
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.tx_errors, 0);
        assert_eq!(engine.census(a).unwrap().in_flight, 1);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Transmitting);

        // Both frames still reached the peer
        for _ in 0..2 {
            assert_eq!(delivered.next().await.unwrap().0, b);
        }

        // The deadline forces exactly one release
        sleep(DEFAULT_TIMEOUT * 2).await;
        let stats = engine.stats(a).unwrap();
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.tx_errors, 1);
        let census = engine.census(a).unwrap();
        assert_eq!(census.in_flight, 0);
        assert_eq!(census.free, 4);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Idle);

        // Nothing else times out
        sleep(DEFAULT_TIMEOUT * 4).await;
        assert_eq!(engine.stats(a).unwrap().tx_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_wakes_blocked_sender() {
        let (engine, _delivered) = start(Config {
            pool_size: 1,
            lockup: NonZeroU64::new(1),
            ..Default::default()
        });
        let a = Device::new(0);
        let frame = engine.compose(a, ETHERTYPE_IPV4, b"stuck").unwrap();
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Blocked);

        // Only the watchdog can release the buffer
        let started = Instant::now();
        engine.unblocked(a).await.unwrap();
        assert!(started.elapsed() >= DEFAULT_TIMEOUT);
        assert_eq!(engine.stats(a).unwrap().tx_errors, 1);
        assert_eq!(engine.stats(a).unwrap().tx_packets, 0);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_releases_queued_completions() {
        let (engine, _delivered) = start(Config {
            pool_size: 4,
            lockup: NonZeroU64::new(3),
            ..Default::default()
        });
        let a = Device::new(0);
        let frame = engine.compose(a, ETHERTYPE_IPV4, b"ordered").unwrap();

        // Lose the completion of the oldest record while later ones are signaled
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        settle().await;
        assert_eq!(engine.stats(a).unwrap().tx_packets, 2);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        settle().await;
        assert_eq!(engine.stats(a).unwrap().tx_packets, 2);
        assert_eq!(engine.census(a).unwrap().in_flight, 3);

        // Recovering the oldest lets the signaled ones complete
        sleep(DEFAULT_TIMEOUT * 2).await;
        let stats = engine.stats(a).unwrap();
        assert_eq!(stats.tx_errors, 1);
        assert_eq!(stats.tx_packets, 4);
        assert_eq!(engine.census(a).unwrap().free, 4);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_record_keeps_its_deadline() {
        let (engine, _delivered) = start(Config {
            lockup: NonZeroU64::new(1),
            ..Default::default()
        });
        let a = Device::new(0);
        let frame = engine.compose(a, ETHERTYPE_IPV4, b"late").unwrap();
        let started = Instant::now();
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);

        // The first times out at its own deadline
        sleep_until(started + DEFAULT_TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(engine.stats(a).unwrap().tx_errors, 1);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Transmitting);

        // The second is not granted a fresh timeout when the first is recovered
        let second = started + Duration::from_millis(10);
        sleep_until(second + DEFAULT_TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(engine.stats(a).unwrap().tx_errors, 2);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_accounting() {
        let cfg = Config {
            pool_size: 2,
            ..Default::default()
        };
        let registry = cfg.registry.clone();
        let (engine, mut delivered) = start(cfg);
        let (a, b) = (Device::new(0), Device::new(1));
        engine.set_receive_interrupts(b, false).unwrap();

        // Fill the peer's queue, then overflow it
        for i in 1..=4u8 {
            let frame = engine.compose(a, ETHERTYPE_IPV4, &[i]).unwrap();
            assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
            settle().await;
        }
        let stats = engine.stats(b).unwrap();
        assert_eq!(stats.rx_packets, 0);
        assert_eq!(stats.rx_dropped, 2);
        let census = engine.census(b).unwrap();
        assert_eq!(census.queued, 2);
        assert!(engine.is_blocked(b).unwrap());
        assert!(delivered.next().now_or_never().is_none());

        // The sender never observes the drops
        let stats = engine.stats(a).unwrap();
        assert_eq!(stats.tx_packets, 4);
        assert_eq!(stats.tx_errors, 0);

        // Enabling interrupts drains the queue in order
        engine.set_receive_interrupts(b, true).unwrap();
        for i in 1..=2u8 {
            let (device, frame) = delivered.next().await.unwrap();
            assert_eq!(device, b);
            assert_eq!(tag(&frame), i);
        }
        settle().await;
        let stats = engine.stats(b).unwrap();
        assert_eq!(stats.rx_packets, 2);
        assert_eq!(stats.rx_dropped, 2);
        assert_eq!(engine.census(b).unwrap().free, 2);

        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).unwrap();
        assert!(buffer.contains("loopback_rx_dropped_total{device=\"dev1\"} 2"));
        assert!(buffer.contains("loopback_rx_packets_total{device=\"dev1\"} 2"));
        assert!(buffer.contains("loopback_tx_packets_total{device=\"dev0\"} 4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_from_delivery() {
        traced();
        let (engine, handler) = Engine::new(Config::default()).unwrap();
        let (a, b) = (Device::new(0), Device::new(1));
        let (sender, mut echoes) = mpsc::unbounded();
        let responder = engine.clone();
        tokio::spawn(handler.run(move |device: Device, frame: Bytes| {
            if device == b {
                // Transmit from inside the handler
                let result = responder.transmit(device, &frame).unwrap();
                assert_eq!(result, Transmit::Accepted);
            } else {
                let _ = sender.unbounded_send(frame);
            }
        }));
        engine.open(a).unwrap();
        engine.open(b).unwrap();

        for i in 0..5u8 {
            let frame = engine.compose(a, ETHERTYPE_IPV4, &[i]).unwrap();
            assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
            let echo = echoes.next().await.unwrap();
            assert_eq!(tag(&echo), i);
        }
        settle().await;
        for device in [a, b] {
            let stats = engine.stats(device).unwrap();
            assert_eq!(stats.tx_packets, 5);
            assert_eq!(stats.rx_packets, 5);
            assert_eq!(engine.census(device).unwrap().free, DEFAULT_POOL_SIZE);
        }
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_randomized_conservation() {
        let (engine, mut delivered) = start(Config {
            peers: pairs(2),
            pool_size: 3,
            lockup: NonZeroU64::new(5),
            rewrite: true,
            ..Default::default()
        });
        let devices: Vec<_> = engine.devices().collect();
        let mut rng = StdRng::seed_from_u64(0);
        let mut accepted = vec![0u64; devices.len()];
        let mut previous = vec![Stats::default(); devices.len()];
        for _ in 0..2_000 {
            let device = devices[rng.gen_range(0..devices.len())];
            match rng.gen_range(0..10) {
                0 => {
                    let enabled = rng.gen_bool(0.5);
                    engine.set_receive_interrupts(device, enabled).unwrap();
                }
                1 => sleep(Duration::from_millis(rng.gen_range(0..30))).await,
                2 => settle().await,
                _ => {
                    let len = rng.gen_range(HEADER_LEN..=200);
                    let mut frame = engine.compose(device, ETHERTYPE_IPV4, &[]).unwrap();
                    frame.resize(len, rng.gen());
                    match engine.transmit(device, &frame).unwrap() {
                        Transmit::Accepted => accepted[device.index()] += 1,
                        Transmit::Blocked => assert!(engine.is_blocked(device).unwrap()),
                        Transmit::Dropped => panic!("device closed"),
                    }
                }
            }

            for device in &devices {
                let census = engine.census(*device).unwrap();
                assert!(census.is_conserved(), "{device}: {census:?}");
                assert_eq!(engine.is_blocked(*device).unwrap(), census.free == 0);

                let stats = engine.stats(*device).unwrap();
                let last = &previous[device.index()];
                assert!(stats.rx_packets >= last.rx_packets);
                assert!(stats.tx_packets >= last.tx_packets);
                assert!(stats.rx_bytes >= last.rx_bytes);
                assert!(stats.tx_bytes >= last.tx_bytes);
                assert!(stats.rx_dropped >= last.rx_dropped);
                assert!(stats.tx_errors >= last.tx_errors);
                previous[device.index()] = stats;
            }
        }

        // Drain everything
        for device in &devices {
            engine.set_receive_interrupts(*device, true).unwrap();
        }
        sleep(DEFAULT_TIMEOUT * 10).await;
        while let Some(Some(_)) = delivered.next().now_or_never() {}
        for device in &devices {
            let census = engine.census(*device).unwrap();
            assert_eq!(census.free, census.capacity);
            assert_eq!(engine.watchdog(*device).unwrap(), Watchdog::Idle);

            // Every accepted transmission completed or was recovered exactly once
            let stats = engine.stats(*device).unwrap();
            assert_eq!(stats.tx_packets + stats.tx_errors, accepted[device.index()]);

            // Every frame sent by the peer was delivered or dropped
            let peer = engine.peer(*device).unwrap();
            assert_eq!(stats.rx_packets + stats.rx_dropped, accepted[peer.index()]);
        }
    }

    #[test]
    fn test_invalid_config() {
        let cfg = Config {
            pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(Engine::new(cfg), Err(Error::EmptyPool)));
        let cfg = Config {
            peers: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(Engine::new(cfg), Err(Error::NoDevices)));
        let cfg = Config {
            peers: vec![1, 2, 0],
            ..Default::default()
        };
        assert!(matches!(Engine::new(cfg), Err(Error::InvalidPairing(0))));
        let cfg = Config {
            timeout: Duration::MAX,
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(cfg),
            Err(Error::InvalidTimeout(timeout)) if timeout == Duration::MAX
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_timeout() {
        let (engine, _delivered) = start(Config {
            timeout: MAX_TIMEOUT,
            lockup: NonZeroU64::new(2),
            ..Default::default()
        });
        let a = Device::new(0);
        let frame = engine.compose(a, ETHERTYPE_IPV4, b"patient").unwrap();
        for _ in 0..3 {
            assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
            settle().await;
        }

        // The lost completion waits on a far deadline without disturbing the others
        let stats = engine.stats(a).unwrap();
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.tx_errors, 0);
        assert_eq!(engine.census(a).unwrap().in_flight, 2);
        assert_eq!(engine.watchdog(a).unwrap(), Watchdog::Transmitting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_interrupts_with_firing_latched() {
        let (engine, mut delivered) = start(Config::default());
        let (a, b) = (Device::new(0), Device::new(1));
        for i in 1..=4u8 {
            let frame = engine.compose(a, ETHERTYPE_IPV4, &[i]).unwrap();
            assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        }

        // Only the firing latched before disabling runs
        engine.set_receive_interrupts(b, false).unwrap();
        settle().await;
        let (device, frame) = delivered.next().await.unwrap();
        assert_eq!(device, b);
        assert_eq!(tag(&frame), 1);
        assert!(delivered.next().now_or_never().is_none());
        assert_eq!(engine.census(b).unwrap().queued, 3);
        assert_eq!(engine.stats(b).unwrap().rx_packets, 1);

        // Enabling delivers the rest in order
        engine.set_receive_interrupts(b, true).unwrap();
        for i in 2..=4u8 {
            assert_eq!(tag(&delivered.next().await.unwrap().1), i);
        }
        settle().await;
        assert_eq!(engine.census(b).unwrap().free, DEFAULT_POOL_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_waiter_per_release() {
        let (engine, _delivered) = start(Config {
            pool_size: 1,
            ..Default::default()
        });
        let a = Device::new(0);
        let frame = engine.compose(a, ETHERTYPE_IPV4, b"wait").unwrap();
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        assert!(engine.is_blocked(a).unwrap());

        let woken = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                let woken = woken.clone();
                tokio::spawn(async move {
                    engine.unblocked(a).await.unwrap();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // A single completion releases a single buffer and wakes a single waiter
        settle().await;
        assert!(!engine.is_blocked(a).unwrap());
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(waiters.iter().filter(|waiter| waiter.is_finished()).count(), 1);

        // The next release wakes the other
        assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
        settle().await;
        assert_eq!(woken.load(Ordering::SeqCst), 2);
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_during_transmit() {
        traced();
        let (engine, handler) = Engine::new(Config {
            peers: pairs(2),
            pool_size: 4,
            ..Default::default()
        })
        .unwrap();
        let handle = tokio::spawn(handler.run(|_: Device, _: Bytes| {}));
        for device in engine.devices() {
            engine.open(device).unwrap();
        }

        // Keep every device transmitting until the engine closes
        let senders: Vec<_> = engine
            .devices()
            .map(|device| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let frame = engine.compose(device, ETHERTYPE_IPV4, b"race").unwrap();
                    loop {
                        match engine.transmit(device, &frame) {
                            Ok(_) => tokio::task::yield_now().await,
                            Err(Error::Closed) => break,
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    }
                })
            })
            .collect();
        sleep(Duration::from_millis(20)).await;
        engine.shutdown();
        for sender in senders {
            sender.await.unwrap();
        }
        handle.await.unwrap();

        // Nothing recorded or queued survives shutdown
        for device in engine.devices() {
            let census = engine.census(device).unwrap();
            assert_eq!(census.free, census.capacity, "{device}: {census:?}");
            assert!(census.is_conserved());
        }
    }
}
