//! Causal ordering via vector clocks
//!
//! A VectorClock records, per device, how many local events that device has
//! produced that the holder knows about. Comparing two clocks yields the
//! happened-before relation, or `Concurrent` when neither side had observed
//! the other.
//!
//! # Ordering policy
//!
//! `compare` is strictly causal. Equal clocks are `Concurrent`, and no
//! sum-of-counters heuristic is applied: two clocks that are causally
//! incomparable stay `Concurrent` even when one has a larger total. Callers
//! that need a total order (conflict resolution) break ties with the
//! operation's timestamp and origin device, never with clock totals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a device/execution context
pub type DeviceId = String;

/// Generate a fresh device id for the lifetime of one context.
pub fn new_device_id() -> DeviceId {
    format!("device-{}", Uuid::new_v4())
}

/// Result of comparing two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Every component is <= the other, at least one strictly less
    Before,
    /// Every component is >= the other, at least one strictly greater
    After,
    /// Neither dominates (includes equality)
    Concurrent,
}

/// Per-device logical clock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Create an empty clock (has seen nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock with a single component
    pub fn at(device: impl Into<DeviceId>, counter: u64) -> Self {
        let mut clock = Self::new();
        clock.counters.insert(device.into(), counter);
        clock
    }

    /// Counter for a device (0 if absent)
    pub fn get(&self, device: &str) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    /// Advance this device's own component by one and return the new value.
    pub fn increment(&mut self, device: &str) -> u64 {
        let counter = self.counters.entry(device.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Join another clock into this one in place (component-wise max).
    pub fn update(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.counters {
            let current = self.counters.entry(device.clone()).or_insert(0);
            if counter > *current {
                *current = counter;
            }
        }
    }

    /// Join two clocks into a new value.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.update(other);
        merged
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut before = false;
        let mut after = false;

        for device in self.counters.keys().chain(other.counters.keys()) {
            let local = self.get(device);
            let remote = other.get(device);
            if local < remote {
                before = true;
            } else if local > remote {
                after = true;
            }
            if before && after {
                return ClockOrdering::Concurrent;
            }
        }

        match (before, after) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            _ => ClockOrdering::Concurrent,
        }
    }

    /// True if this clock strictly happened before `other`
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// True if this clock has seen everything `other` has seen
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.counters.iter().all(|(d, c)| self.get(d) >= *c)
    }

    /// All devices with a component in this clock
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.counters.keys()
    }

    /// Sum of all components. Informational only, never used for ordering.
    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|c| *c == 0)
    }
}
