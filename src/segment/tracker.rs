//! Reference counting for safe segment deletion.
//!
//! Readers acquire references through a snapshot; a merge that retires a
//! segment only marks it for deletion. The segment is handed back for
//! physical deletion once the last reference is released.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct TrackerState {
    /// Generation -> number of snapshots holding it.
    ref_counts: AHashMap<u64, usize>,
    /// Retired generations waiting for their last reference to go away.
    pending_deletions: AHashSet<u64>,
}

/// Tracks segment references and pending deletions.
#[derive(Debug, Default)]
pub struct SegmentTracker {
    state: Mutex<TrackerState>,
}

impl SegmentTracker {
    /// Create a new segment tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly published segment.
    pub fn register(&self, generation: u64) {
        self.state.lock().ref_counts.entry(generation).or_insert(0);
    }

    /// Acquire references to a set of segments. Segments already retired are
    /// skipped; the acquired generations are returned.
    pub fn acquire(&self, generations: &[u64]) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut acquired = Vec::with_capacity(generations.len());
        for &generation in generations {
            if state.pending_deletions.contains(&generation) {
                continue;
            }
            *state.ref_counts.entry(generation).or_insert(0) += 1;
            acquired.push(generation);
        }
        acquired
    }

    /// Release references. Returns the generations whose count dropped to
    /// zero while marked for deletion.
    pub fn release(&self, generations: &[u64]) -> Vec<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut ready = Vec::new();
        for &generation in generations {
            let Some(count) = state.ref_counts.get_mut(&generation) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 && state.pending_deletions.remove(&generation) {
                state.ref_counts.remove(&generation);
                ready.push(generation);
            }
        }
        ready
    }

    /// Mark retired segments for deletion. Unreferenced ones are returned
    /// immediately, the rest wait for their readers.
    pub fn mark_for_deletion(&self, generations: &[u64]) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut ready = Vec::new();
        for &generation in generations {
            let refs = state.ref_counts.get(&generation).copied().unwrap_or(0);
            if refs == 0 {
                state.ref_counts.remove(&generation);
                ready.push(generation);
            } else {
                state.pending_deletions.insert(generation);
            }
        }
        ready
    }

    /// Number of snapshots currently holding a segment.
    pub fn ref_count(&self, generation: u64) -> usize {
        self.state
            .lock()
            .ref_counts
            .get(&generation)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a retired segment is still waiting for readers.
    pub fn is_pending_deletion(&self, generation: u64) -> bool {
        self.state.lock().pending_deletions.contains(&generation)
    }

    /// Number of retired segments still waiting for readers.
    pub fn pending_deletion_count(&self) -> usize {
        self.state.lock().pending_deletions.len()
    }
}
