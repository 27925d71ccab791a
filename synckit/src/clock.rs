//! Vector clocks for causal ordering of document deltas.
//!
//! Each client owns one component of the clock; a delta's clock captures
//! everything its origin had observed when the edit was made. The hub
//! compares clocks to decide which deltas a client still needs and to
//! enforce per-origin monotonicity.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Largest counter value that survives a round trip through a JSON
/// number treated as a 64-bit float on the client side (2^53 - 1).
pub const SAFE_COUNTER_MAX: u64 = (1u64 << 53) - 1;

/// Outcome of comparing two vector clocks under the happens-before
/// partial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Identical component-wise.
    Equal,
    /// Self happens-before other.
    Before,
    /// Other happens-before self.
    After,
    /// Neither precedes the other.
    Concurrent,
}

/// Mapping from client id to a per-client monotonic counter.
///
/// Missing keys read as zero and zero counters are never stored, so two
/// clocks that differ only in explicit zeros compare equal. Serializes
/// as a plain JSON object (`{}` when empty); keys are kept sorted so
/// encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Explicit zeros on the wire are the same as missing keys.
        let raw = BTreeMap::<String, u64>::deserialize(deserializer)?;
        Ok(raw.into_iter().filter(|(_, v)| *v > 0).collect())
    }
}

impl VectorClock {
    /// The empty clock (all components zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `client_id`; zero when absent.
    pub fn get(&self, client_id: &str) -> u64 {
        self.counters.get(client_id).copied().unwrap_or(0)
    }

    /// Set a single component. Zero removes the entry.
    pub fn set(&mut self, client_id: impl Into<String>, counter: u64) {
        let client_id = client_id.into();
        if counter == 0 {
            self.counters.remove(&client_id);
        } else {
            self.counters.insert(client_id, counter);
        }
    }

    /// New clock with `client_id`'s counter incremented by one.
    pub fn tick(&self, client_id: &str) -> Self {
        let mut next = self.clone();
        let counter = next.get(client_id).saturating_add(1);
        next.counters.insert(client_id.to_string(), counter);
        next
    }

    /// Pointwise max merge. Commutative, associative, idempotent.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &counter) in &other.counters {
            let entry = self.counters.entry(client.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// `merge` without mutating self.
    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Compare under the happens-before partial order.
    ///
    /// O(|union of keys|): one pass over each side's entries.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_less = false;
        let mut other_less = false;

        for (client, &counter) in &self.counters {
            let theirs = other.get(client);
            if counter < theirs {
                self_less = true;
            } else if counter > theirs {
                other_less = true;
            }
        }
        for (client, &counter) in &other.counters {
            if !self.counters.contains_key(client) && counter > 0 {
                self_less = true;
            }
        }

        match (self_less, other_less) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True iff every component of self is <= other and at least one is
    /// strictly smaller.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// True iff neither clock precedes the other and they are not equal.
    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// True iff self is dominated by or equal to `other`.
    ///
    /// A delta whose clock satisfies this has already been observed by a
    /// client presenting `other`.
    pub fn observed_by(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Equal | ClockOrdering::Before
        )
    }

    /// Reject counters beyond [`SAFE_COUNTER_MAX`].
    ///
    /// Called at the codec boundary so oversized counters are refused
    /// rather than silently truncated by a float-based client.
    pub fn validate(&self) -> Result<(), u64> {
        for &counter in self.counters.values() {
            if counter > SAFE_COUNTER_MAX {
                return Err(counter);
            }
        }
        Ok(())
    }

    /// Number of non-zero components.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True when every component is zero.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate over (client id, counter) pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (client, counter) in iter {
            clock.set(client, counter);
        }
        clock
    }
}
