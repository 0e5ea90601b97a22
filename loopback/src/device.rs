//! Per-device state guarded by the device's lock.

use crate::{
    frame::Address,
    interrupt::Line,
    metrics::Counters,
    pool::{Arena, Owner, Pool, Slot},
    queue::Queue,
    watchdog::Watchdog,
    Device,
};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

/// Snapshot of a device's statistics.
///
/// Every counter is monotonically non-decreasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames delivered to the upper layer.
    pub rx_packets: u64,
    /// Transmissions completed.
    pub tx_packets: u64,
    /// Bytes delivered to the upper layer.
    pub rx_bytes: u64,
    /// Bytes of completed transmissions.
    pub tx_bytes: u64,
    /// Frames dropped because the receive pool was exhausted.
    pub rx_dropped: u64,
    /// Transmissions whose completion was lost and recovered by the watchdog.
    pub tx_errors: u64,
}

/// Where a device's buffers are, taken atomically under the device lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Census {
    /// Buffers allocated to the device.
    pub capacity: usize,
    /// Buffers on the free list.
    pub free: usize,
    /// Buffers on the receive queue.
    pub queued: usize,
    /// Buffers reserved by transmissions awaiting completion.
    pub in_flight: usize,
    /// Buffers handed to the upper layer and not yet returned.
    pub delivering: usize,
}

impl Census {
    /// Whether every buffer is accounted for exactly once.
    pub fn is_conserved(&self) -> bool {
        self.free + self.queued + self.in_flight + self.delivering == self.capacity
    }
}

/// A transmission awaiting its completion.
pub(crate) struct InFlight {
    /// Position of the transmission among all submissions on the device.
    pub seq: u64,
    pub slot: Slot,
    pub len: usize,
    pub started: Instant,
    /// Whether the completion has been raised.
    pub signaled: bool,
}

/// A device and the lock protecting its state.
pub(crate) struct Endpoint {
    state: Mutex<State>,
    /// Notified once for every release that unblocks the pool.
    pub unblocked: Notify,
}

impl Endpoint {
    pub fn new(device: Device, pool_size: usize, counters: Counters) -> Self {
        let mut arena = Arena::new(pool_size);
        let pool = Pool::new(&mut arena);
        Self {
            state: Mutex::new(State {
                device,
                address: Address::ZERO,
                ready: false,
                rx_interrupts: true,
                line: Line::new(),
                arena,
                pool,
                rx: Queue::default(),
                in_flight: VecDeque::new(),
                delivering: 0,
                watchdog: Watchdog::Idle,
                submitted: 0,
                stats: Stats::default(),
                counters,
            }),
            unblocked: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// Mutable state of a device.
pub(crate) struct State {
    device: Device,
    pub address: Address,
    pub ready: bool,
    pub rx_interrupts: bool,
    pub line: Line,
    arena: Arena,
    pool: Pool,
    rx: Queue,
    /// Outstanding transmissions, oldest first.
    pub in_flight: VecDeque<InFlight>,
    delivering: usize,
    pub watchdog: Watchdog,
    /// Transmissions accepted since the engine started, used to number them.
    pub submitted: u64,
    stats: Stats,
    counters: Counters,
}

impl State {
    /// Take a buffer from the pool on behalf of `owner`.
    pub fn acquire(&mut self, owner: Owner) -> Option<Slot> {
        let slot = self.pool.acquire(&mut self.arena, owner)?;
        if self.pool.is_blocked() {
            debug!(device = %self.device, "pool exhausted, stopping queue");
        }
        Some(slot)
    }

    /// Return a buffer held by `owner` to the pool.
    ///
    /// Returns true if the release unblocked the device.
    pub fn release(&mut self, slot: Slot, owner: Owner) -> bool {
        let unblocked = self.pool.release(&mut self.arena, slot, owner);
        if unblocked {
            debug!(device = %self.device, "buffer released, waking queue");
        }
        unblocked
    }

    pub fn is_blocked(&self) -> bool {
        self.pool.is_blocked()
    }

    pub fn write(&mut self, slot: Slot, frame: &[u8]) {
        self.arena.write(slot, frame);
    }

    pub fn frame(&self, slot: Slot) -> &[u8] {
        self.arena.frame(slot)
    }

    pub fn frame_mut(&mut self, slot: Slot) -> &mut [u8] {
        self.arena.frame_mut(slot)
    }

    /// Append a received buffer to the queue.
    pub fn enqueue(&mut self, slot: Slot) {
        self.rx.enqueue(&mut self.arena, slot);
    }

    /// Remove the oldest received buffer for delivery.
    pub fn dequeue(&mut self) -> Option<Slot> {
        let slot = self.rx.dequeue(&mut self.arena, Owner::Delivering)?;
        self.delivering += 1;
        Some(slot)
    }

    /// Return a buffer after the upper layer has consumed it.
    pub fn delivered(&mut self, slot: Slot) -> bool {
        self.delivering -= 1;
        self.release(slot, Owner::Delivering)
    }

    pub fn has_queued(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Mark the transmission numbered `seq` as completed.
    ///
    /// Returns false if it is no longer outstanding (recovered by the watchdog or reclaimed).
    pub fn signal(&mut self, seq: u64) -> bool {
        match self.in_flight.iter_mut().find(|record| record.seq == seq) {
            Some(record) => {
                record.signaled = true;
                true
            }
            None => false,
        }
    }

    /// Whether the oldest outstanding transmission has raised its completion.
    pub fn oldest_signaled(&self) -> bool {
        self.in_flight.front().is_some_and(|record| record.signaled)
    }

    /// Return every queued and in-flight buffer to the pool.
    ///
    /// Returns the number of buffers reclaimed and whether the device was unblocked.
    pub fn reclaim(&mut self) -> (usize, bool) {
        let mut reclaimed = 0;
        let mut unblocked = false;
        while let Some(slot) = self.rx.dequeue(&mut self.arena, Owner::Queue) {
            unblocked |= self.release(slot, Owner::Queue);
            reclaimed += 1;
        }
        while let Some(record) = self.in_flight.pop_front() {
            unblocked |= self.release(record.slot, Owner::InFlight);
            reclaimed += 1;
        }
        self.watchdog = Watchdog::Idle;
        (reclaimed, unblocked)
    }

    pub fn received(&mut self, len: usize) {
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += len as u64;
        self.counters.rx_packets.inc();
        self.counters.rx_bytes.inc_by(len as u64);
    }

    pub fn transmitted(&mut self, len: usize) {
        self.stats.tx_packets += 1;
        self.stats.tx_bytes += len as u64;
        self.counters.tx_packets.inc();
        self.counters.tx_bytes.inc_by(len as u64);
    }

    pub fn dropped(&mut self) {
        self.stats.rx_dropped += 1;
        self.counters.rx_dropped.inc();
    }

    pub fn timed_out(&mut self) {
        self.stats.tx_errors += 1;
        self.counters.tx_errors.inc();
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn census(&self) -> Census {
        let census = Census {
            capacity: self.arena.capacity(),
            free: self.pool.free(),
            queued: self.rx.len(),
            in_flight: self.in_flight.len(),
            delivering: self.delivering,
        };
        debug_assert_eq!(
            self.arena.owners(),
            [
                census.free,
                census.in_flight,
                census.queued,
                census.delivering
            ],
            "{} buffer owners disagree with its collections",
            self.device
        );
        debug_assert_eq!(self.pool.iter(&self.arena).count(), census.free);
        census
    }
}
