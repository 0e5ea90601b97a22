//! Simulated interrupt line of a device.
//!
//! Causes are latched into a status word. The raise that takes the word from empty to non-empty
//! is the only one that schedules a firing, so each device has at most one firing outstanding.
//! The handler reads and clears the whole word at once when the firing runs.

use crate::Device;
use bitflags::bitflags;
use tokio::time::Instant;

bitflags! {
    /// Causes latched in a device's status word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// A received frame is waiting on the queue.
        const RX = 1 << 0;
        /// A transmission has completed.
        const TX = 1 << 1;
    }
}

/// Status word of a device.
pub struct Line {
    status: Status,
}

impl Line {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            status: Status::empty(),
        }
    }

    /// Latch `cause`.
    ///
    /// Returns true if the caller must schedule a firing.
    pub fn raise(&mut self, cause: Status) -> bool {
        let idle = self.status.is_empty();
        self.status |= cause;
        idle
    }

    /// Read and clear the status word.
    pub fn take(&mut self) -> Status {
        std::mem::replace(&mut self.status, Status::empty())
    }
}

/// Work sent to the [crate::Handler].
#[derive(Debug)]
pub enum Message {
    /// The status word of a device has a cause latched.
    Fire(Device),
    /// A device started transmitting and must complete by `deadline`.
    Watch { device: Device, deadline: Instant },
}
