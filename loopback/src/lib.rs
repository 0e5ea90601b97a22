//! Simulate pairs of cross-wired network interfaces with finite buffer pools, coalesced interrupts,
//! and a transmit watchdog.
//!
//! Every device is paired with exactly one peer. A frame transmitted on one device is copied into a
//! buffer taken from its peer's pool, queued, and later handed to the upper layer by the [Handler].
//! Each transmission also reserves a buffer on the sender until its completion is processed, so a
//! sender that outpaces the handler observes [Transmit::Blocked] and must wait for
//! [Engine::unblocked] before retrying. Completions that never arrive are recovered by a per-device
//! watchdog.
//!
//! # Status
//!
//! `commonware-loopback` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use commonware_loopback::{frame::ETHERTYPE_IPV4, Config, Device, Engine, Transmit};
//! use futures::StreamExt;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//! runtime.block_on(async {
//!     let (engine, handler) = Engine::new(Config::default()).unwrap();
//!     let (sender, mut receiver) = futures::channel::mpsc::unbounded();
//!     tokio::spawn(handler.run(move |device: Device, frame: Bytes| {
//!         let _ = sender.unbounded_send((device, frame));
//!     }));
//!
//!     let (a, b) = (Device::new(0), Device::new(1));
//!     engine.open(a).unwrap();
//!     engine.open(b).unwrap();
//!     let frame = engine.compose(a, ETHERTYPE_IPV4, b"hello").unwrap();
//!     assert_eq!(engine.transmit(a, &frame).unwrap(), Transmit::Accepted);
//!
//!     let (device, received) = receiver.next().await.unwrap();
//!     assert_eq!(device, b);
//!     assert_eq!(&received[..frame.len()], &frame[..]);
//!     engine.shutdown();
//! });
//! ```

use bytes::Bytes;
use std::{fmt, time::Duration};
use thiserror::Error;

pub mod config;
mod device;
mod engine;
pub mod frame;
mod interrupt;
mod metrics;
mod pool;
mod queue;
mod watchdog;

pub use config::Config;
pub use device::{Census, Stats};
pub use engine::{Engine, Handler};
pub use watchdog::Watchdog;

/// Errors that can occur when interacting with an [Engine].
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame too short: {0}")]
    FrameTooShort(usize),
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("unknown device: {0}")]
    UnknownDevice(usize),
    #[error("pool must hold at least one buffer")]
    EmptyPool,
    #[error("timeout too large: {0:?}")]
    InvalidTimeout(Duration),
    #[error("no devices")]
    NoDevices,
    #[error("invalid pairing for device: {0}")]
    InvalidPairing(usize),
    #[error("engine closed")]
    Closed,
}

/// Index of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Device(usize);

impl Device {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Outcome of a transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transmit {
    /// The frame was handed to the peer (which may still have dropped it).
    Accepted,
    /// The sender has no free buffer. Nothing was sent.
    Blocked,
    /// The sender is not open. Nothing was sent.
    Dropped,
}

/// Upper layer that consumes frames received by a device.
pub trait Deliver: Send + 'static {
    fn deliver(&mut self, device: Device, frame: Bytes);
}

impl<F> Deliver for F
where
    F: FnMut(Device, Bytes) + Send + 'static,
{
    fn deliver(&mut self, device: Device, frame: Bytes) {
        self(device, frame)
    }
}
