//! Time-windowed coalescing for continuous-controller traffic.
//! An expression pedal can emit tens of updates per second; consumers only
//! need the latest value per (channel, controller) key within one window.
//! The buffer itself is passive; the coordinator drains it on a fixed tick,
//! which bounds delivery latency to one window regardless of arrival rate.

use std::collections::HashMap;
use std::time::Instant;

use crate::bus::BusMessage;

/// One pending value for a (channel, controller) key.
#[derive(Debug, Clone, Copy)]
struct CoalescerEntry {
    value: u8,
    /// When the first update of the current window arrived.
    first_seen: Instant,
}

/// Latest-value-wins buffer keyed by (channel, controller).
///
/// Invariant: at most one pending entry per key. Discrete button events
/// never pass through here; the coordinator forwards those immediately.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending: HashMap<(u8, u8), CoalescerEntry>,
    merged: u64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an update. A later update for the same key overwrites the
    /// pending value but keeps the original arrival timestamp.
    pub fn offer(&mut self, channel: u8, controller: u8, value: u8) {
        use std::collections::hash_map::Entry;
        match self.pending.entry((channel, controller)) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().value = value;
                self.merged += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(CoalescerEntry { value, first_seen: Instant::now() });
            }
        }
    }

    /// Emits exactly one message per pending key, carrying its most recent
    /// value, and clears all pending state. Output is ordered by key so
    /// cross-key emission order is deterministic.
    pub fn drain(&mut self) -> Vec<BusMessage> {
        let mut entries: Vec<_> = self.pending.drain().collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
            .into_iter()
            .map(|((channel, controller), entry)| BusMessage::ControlChange {
                channel,
                controller,
                value: entry.value,
            })
            .collect()
    }

    /// Number of keys currently waiting for the next drain.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Total updates merged away (overwritten before a drain) so far.
    pub fn merged_count(&self) -> u64 {
        self.merged
    }

    /// Age of the oldest pending entry, if any.
    pub fn oldest_pending_age(&self) -> Option<std::time::Duration> {
        self.pending.values().map(|e| e.first_seen.elapsed()).max()
    }
}
