//! Transmit watchdog state and the deadline timers that drive it.

use std::{
    collections::{BTreeSet, HashMap},
    hash::Hash,
};
use tokio::time::Instant;

/// Watchdog state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Watchdog {
    /// No transmission is outstanding.
    #[default]
    Idle,
    /// At least one transmission is waiting for its completion.
    Transmitting,
    /// The oldest transmission missed its deadline and is being recovered.
    TimedOut,
}

impl Watchdog {
    /// Record a submission.
    ///
    /// Returns true if the device was idle and a deadline must be armed.
    pub(crate) fn start(&mut self) -> bool {
        if *self != Self::Idle {
            return false;
        }
        *self = Self::Transmitting;
        true
    }
}

/// Set of deadlines with at most one entry per key.
pub struct Timers<K: Copy + Ord + Hash> {
    deadlines: BTreeSet<(Instant, K)>,
    keys: HashMap<K, Instant>,
}

impl<K: Copy + Ord + Hash> Timers<K> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            deadlines: BTreeSet::new(),
            keys: HashMap::new(),
        }
    }

    /// Arm `key`, replacing any deadline it already has.
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        if let Some(previous) = self.keys.insert(key, deadline) {
            self.deadlines.remove(&(previous, key));
        }
        self.deadlines.insert((deadline, key));
    }

    /// Disarm `key`.
    ///
    /// Returns whether a deadline was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.keys.remove(key) {
            Some(deadline) => {
                self.deadlines.remove(&(deadline, *key));
                true
            }
            None => false,
        }
    }

    /// Earliest pending deadline.
    pub fn next(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest key whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<K> {
        let (deadline, key) = *self.deadlines.first()?;
        if deadline > now {
            return None;
        }
        self.deadlines.pop_first();
        self.keys.remove(&key);
        Some(key)
    }
}
