//! Last-known ticker snapshot per instrument.
//!
//! The cache is an explicitly owned store injected into every component that
//! needs market state. It is sharded (`DashMap`), so connections writing
//! different instruments never contend on a single lock.
//!
//! Sequence numbers are enforced per instrument: a snapshot whose sequence is
//! not strictly greater than the last accepted one is rejected and leaves the
//! entry untouched.

use dashmap::DashMap;

use super::types::TickerSnapshot;

/// Outcome of offering a snapshot to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// Snapshot stored; `previous` is the sequence it replaced
    Accepted { previous: Option<u64> },
    /// Duplicate or out-of-order snapshot; cache unchanged
    Rejected { last_sequence: u64 },
}

impl CacheUpdate {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CacheUpdate::Accepted { .. })
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    snapshot: Option<TickerSnapshot>,
    /// Sequence floor; cleared when the carrying connection restarts its numbering
    last_sequence: Option<u64>,
}

/// Sharded ticker store
#[derive(Debug, Default)]
pub struct TickerCache {
    entries: DashMap<String, CacheEntry>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a snapshot; stored only when its sequence moves forward.
    pub fn apply(&self, snapshot: TickerSnapshot) -> CacheUpdate {
        let mut entry = self
            .entries
            .entry(snapshot.instrument_id.clone())
            .or_default();

        if let Some(last) = entry.last_sequence {
            if snapshot.sequence <= last {
                return CacheUpdate::Rejected {
                    last_sequence: last,
                };
            }
        }

        let previous = entry.last_sequence;
        entry.last_sequence = Some(snapshot.sequence);
        entry.snapshot = Some(snapshot);
        CacheUpdate::Accepted { previous }
    }

    /// Forget the sequence floor for instruments whose stream restarted.
    ///
    /// The exchange numbers frames per socket, so a fresh socket starts over.
    /// Cached snapshots are kept.
    pub fn reset_sequences(&self, instrument_ids: &[String]) {
        for id in instrument_ids {
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.last_sequence = None;
            }
        }
    }

    pub fn get(&self, instrument_id: &str) -> Option<TickerSnapshot> {
        self.entries
            .get(instrument_id)
            .and_then(|e| e.snapshot.clone())
    }

    pub fn last_price(&self, instrument_id: &str) -> Option<f64> {
        self.entries
            .get(instrument_id)
            .and_then(|e| e.snapshot.as_ref().map(|s| s.price))
    }

    pub fn last_sequence(&self, instrument_id: &str) -> Option<u64> {
        self.entries.get(instrument_id).and_then(|e| e.last_sequence)
    }

    /// Number of instruments with a cached snapshot
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.snapshot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
