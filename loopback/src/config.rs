//! Configuration of an [crate::Engine].

use crate::{Device, Error};
use prometheus_client::registry::Registry;
use std::{
    num::NonZeroU64,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Default number of buffers in each device's pool.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Default time a transmission may wait for its completion.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20);

/// Longest timeout accepted by [crate::Engine::new].
///
/// Deadlines are computed by adding the timeout to the current instant, so it must stay far from
/// the limit of the clock.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Configuration for an [crate::Engine].
#[derive(Clone)]
pub struct Config {
    /// Registry the engine's counters are registered with.
    pub registry: Arc<Mutex<Registry>>,

    /// Peer of each device, indexed by device.
    ///
    /// Every device must be paired with exactly one other device, and pairing must be symmetric.
    pub peers: Vec<usize>,

    /// Number of buffers allocated to each device.
    pub pool_size: usize,

    /// Time a transmission may wait for its completion before the watchdog recovers it.
    ///
    /// Must not exceed [MAX_TIMEOUT].
    pub timeout: Duration,

    /// If set, the completion of every n-th transmission on a device is never raised.
    ///
    /// Used to exercise the watchdog.
    pub lockup: Option<NonZeroU64>,

    /// Whether frames carrying IPv4 are moved between the two simulated address ranges before
    /// delivery. When unset, frames are delivered unchanged.
    pub rewrite: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            peers: pairs(1),
            pool_size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
            lockup: None,
            rewrite: false,
        }
    }
}

/// Peers for `count` pairs of devices, where device `2i` is cross-wired to device `2i + 1`.
pub fn pairs(count: usize) -> Vec<usize> {
    (0..count * 2).map(|index| index ^ 1).collect()
}

/// Validated, immutable pairing table.
pub(crate) struct Pairing(Vec<Device>);

impl Pairing {
    pub fn new(peers: &[usize]) -> Result<Self, Error> {
        if peers.is_empty() {
            return Err(Error::NoDevices);
        }
        for (index, peer) in peers.iter().enumerate() {
            if *peer == index || peers.get(*peer) != Some(&index) {
                return Err(Error::InvalidPairing(index));
            }
        }
        Ok(Self(peers.iter().copied().map(Device::new).collect()))
    }

    pub fn peer(&self, device: Device) -> Device {
        self.0[device.index()]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs() {
        assert_eq!(pairs(1), vec![1, 0]);
        assert_eq!(pairs(2), vec![1, 0, 3, 2]);
        assert!(pairs(0).is_empty());
    }

    #[test]
    fn test_pairing() {
        let pairing = Pairing::new(&pairs(2)).unwrap();
        assert_eq!(pairing.len(), 4);
        assert_eq!(pairing.peer(Device::new(0)), Device::new(1));
        assert_eq!(pairing.peer(Device::new(3)), Device::new(2));

        // Any symmetric matching is accepted
        let pairing = Pairing::new(&[2, 3, 0, 1]).unwrap();
        assert_eq!(pairing.peer(Device::new(1)), Device::new(3));
    }

    #[test]
    fn test_invalid_pairing() {
        assert!(matches!(Pairing::new(&[]), Err(Error::NoDevices)));
        assert!(matches!(Pairing::new(&[0]), Err(Error::InvalidPairing(0))));
        assert!(matches!(Pairing::new(&[1]), Err(Error::InvalidPairing(0))));
        assert!(matches!(
            Pairing::new(&[1, 2, 0]),
            Err(Error::InvalidPairing(0))
        ));
        assert!(matches!(
            Pairing::new(&[1, 0, 2]),
            Err(Error::InvalidPairing(2))
        ));
    }
}
