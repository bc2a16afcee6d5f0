//! The live segment set.
//!
//! Every mutation of the set of segments (appending a flushed segment,
//! applying deletes, reserving inputs for a merge, publishing a merge
//! output) goes through the one mutex in [`SegmentSet`]. The lock guards
//! bookkeeping only; merge I/O and file deletion happen after it is
//! released.
//!
//! # Locking model
//!
//! ```text
//! Lock ordering (acquire in this order):
//!   1. state           - parking_lot::Mutex, never held across I/O
//!   2. tracker.state   - parking_lot::Mutex, sub-microsecond hold
//!
//! deleter            - parking_lot::RwLock, cloned out before calling it
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::{PhalanxError, Result};
use crate::segment::SegmentDescriptor;
use crate::segment::tracker::SegmentTracker;

/// Callback that physically removes retired segments.
pub type SegmentDeleter = Arc<dyn Fn(&[u64]) + Send + Sync>;

/// Outcome of trying to reserve merge inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// All inputs were free; they are now marked as merging. Carries the
    /// current descriptors of the inputs.
    Reserved(Vec<SegmentDescriptor>),

    /// At least one input is already part of an in-flight merge.
    Busy,

    /// At least one input is no longer live.
    Stale,
}

/// Result of publishing a merge output.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// The published segment, including deletes that landed on the inputs
    /// while the merge ran.
    pub output: SegmentDescriptor,

    /// Input bytes minus output bytes.
    pub reclaimed_bytes: u64,

    /// Total bytes of the live set after publication.
    pub total_bytes: u64,

    /// Number of live segments after publication.
    pub segment_count: usize,
}

#[derive(Debug, Default)]
struct SegmentSetState {
    live: BTreeMap<u64, SegmentDescriptor>,
    merging: AHashSet<u64>,
    next_generation: u64,
    version: u64,
}

impl SegmentSetState {
    fn total_bytes(&self) -> u64 {
        self.live.values().map(|s| s.size_bytes).sum()
    }
}

/// The live set of segments plus the in-flight merge reservations.
pub struct SegmentSet {
    state: Mutex<SegmentSetState>,
    tracker: Arc<SegmentTracker>,
    deleter: RwLock<Option<SegmentDeleter>>,
}

impl fmt::Debug for SegmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SegmentSet")
            .field("segments", &state.live.len())
            .field("merging", &state.merging.len())
            .field("version", &state.version)
            .finish()
    }
}

impl Default for SegmentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentSet {
    /// Create an empty segment set. Generations start at 1.
    pub fn new() -> Self {
        SegmentSet {
            state: Mutex::new(SegmentSetState {
                next_generation: 1,
                ..Default::default()
            }),
            tracker: Arc::new(SegmentTracker::new()),
            deleter: RwLock::new(None),
        }
    }

    /// Create a set from segments loaded at index-open time.
    pub fn with_segments(segments: Vec<SegmentDescriptor>) -> Result<Self> {
        let set = SegmentSet::new();
        for segment in segments {
            set.add(segment)?;
        }
        Ok(set)
    }

    /// Install the callback used to delete retired segments.
    pub fn set_deleter(&self, deleter: SegmentDeleter) {
        *self.deleter.write() = Some(deleter);
    }

    /// Reference tracker shared with snapshots.
    pub fn tracker(&self) -> Arc<SegmentTracker> {
        Arc::clone(&self.tracker)
    }

    /// Allocate a fresh generation for a flushed or merged segment.
    pub fn next_generation(&self) -> u64 {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        generation
    }

    /// Append a newly flushed segment.
    pub fn add(&self, segment: SegmentDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        if state.live.contains_key(&segment.generation) {
            return Err(PhalanxError::segment(format!(
                "segment generation {} is already live",
                segment.generation
            )));
        }
        state.next_generation = state.next_generation.max(segment.generation + 1);
        self.tracker.register(segment.generation);
        state.live.insert(segment.generation, segment);
        state.version += 1;
        Ok(())
    }

    /// Mark `count` documents of a live segment as deleted. The descriptor is
    /// replaced, not mutated.
    pub fn apply_deletes(&self, generation: u64, count: u64) -> Result<SegmentDescriptor> {
        let mut state = self.state.lock();
        let current = state.live.get(&generation).ok_or_else(|| {
            PhalanxError::segment(format!("segment generation {generation} is not live"))
        })?;
        let updated = current.with_deletes(count);
        state.live.insert(generation, updated.clone());
        state.version += 1;
        Ok(updated)
    }

    /// Live segments ordered by generation.
    pub fn segments(&self) -> Vec<SegmentDescriptor> {
        self.state.lock().live.values().cloned().collect()
    }

    /// Live segments and the generations currently reserved by merges, read
    /// under one lock so the pair is consistent.
    pub fn merge_view(&self) -> (Vec<SegmentDescriptor>, AHashSet<u64>) {
        let state = self.state.lock();
        (
            state.live.values().cloned().collect(),
            state.merging.clone(),
        )
    }

    /// Current descriptor of a live segment.
    pub fn get(&self, generation: u64) -> Option<SegmentDescriptor> {
        self.state.lock().live.get(&generation).cloned()
    }

    /// Whether a generation is live.
    pub fn contains(&self, generation: u64) -> bool {
        self.state.lock().live.contains_key(&generation)
    }

    /// Whether a generation is reserved by an in-flight merge.
    pub fn is_merging(&self, generation: u64) -> bool {
        self.state.lock().merging.contains(&generation)
    }

    /// Number of live segments.
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether there are no live segments.
    pub fn is_empty(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    /// Total bytes of all live segments.
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes()
    }

    /// Counter bumped by every mutation of the live set.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Atomically reserve a group of segments for one merge.
    pub fn try_reserve(&self, generations: &[u64]) -> Reservation {
        let mut state = self.state.lock();
        if generations.iter().any(|g| !state.live.contains_key(g)) {
            return Reservation::Stale;
        }
        if generations.iter().any(|g| state.merging.contains(g)) {
            return Reservation::Busy;
        }
        let mut reserved = Vec::with_capacity(generations.len());
        for generation in generations {
            state.merging.insert(*generation);
            if let Some(segment) = state.live.get(generation) {
                reserved.push(segment.clone());
            }
        }
        Reservation::Reserved(reserved)
    }

    /// Drop reservations without publishing anything. Inputs stay live.
    pub fn release(&self, generations: &[u64]) {
        let mut state = self.state.lock();
        for generation in generations {
            state.merging.remove(generation);
        }
    }

    /// Publish a merge output and retire its inputs in one step.
    ///
    /// `inputs` are the descriptors as they were when the merge was
    /// reserved. Deletes applied to the inputs since then are carried over
    /// to the output so that no deleted document comes back.
    pub fn commit_merge(
        &self,
        inputs: &[SegmentDescriptor],
        output: SegmentDescriptor,
    ) -> Result<CommitOutcome> {
        let input_generations: Vec<u64> = inputs.iter().map(|s| s.generation).collect();
        let outcome = {
            let mut state = self.state.lock();
            for generation in &input_generations {
                if !state.live.contains_key(generation) || !state.merging.contains(generation) {
                    return Err(PhalanxError::segment(format!(
                        "merge input {generation} is not a reserved live segment"
                    )));
                }
            }
            if state.live.contains_key(&output.generation) {
                return Err(PhalanxError::segment(format!(
                    "merge output generation {} is already live",
                    output.generation
                )));
            }

            let mut carried_deletes = 0;
            let mut input_bytes = 0;
            for input in inputs {
                if let Some(current) = state.live.remove(&input.generation) {
                    carried_deletes += current.deleted_docs.saturating_sub(input.deleted_docs);
                    input_bytes += current.size_bytes;
                }
                state.merging.remove(&input.generation);
            }

            let output = if carried_deletes > 0 {
                debug!(
                    "carrying {carried_deletes} deletes into merged segment {}",
                    output.generation
                );
                output.with_deletes(carried_deletes)
            } else {
                output
            };

            state.next_generation = state.next_generation.max(output.generation + 1);
            self.tracker.register(output.generation);
            state.live.insert(output.generation, output.clone());
            state.version += 1;

            CommitOutcome {
                reclaimed_bytes: input_bytes.saturating_sub(output.size_bytes),
                output,
                total_bytes: state.total_bytes(),
                segment_count: state.live.len(),
            }
        };

        let ready = self.tracker.mark_for_deletion(&input_generations);
        self.delete(&ready);
        Ok(outcome)
    }

    /// Take a consistent, reference-holding view of the live segments.
    pub fn snapshot(&self) -> SegmentSnapshot {
        let (segments, version) = {
            let state = self.state.lock();
            let segments: Vec<SegmentDescriptor> = state.live.values().cloned().collect();
            let generations: Vec<u64> = segments.iter().map(|s| s.generation).collect();
            self.tracker.acquire(&generations);
            (segments, state.version)
        };
        SegmentSnapshot {
            tracker: Arc::clone(&self.tracker),
            deleter: self.deleter.read().clone(),
            segments,
            version,
        }
    }

    fn delete(&self, generations: &[u64]) {
        if generations.is_empty() {
            return;
        }
        let deleter = self.deleter.read().clone();
        if let Some(deleter) = deleter {
            deleter(generations);
        }
    }
}

/// A consistent view of the live segments that keeps them from being
/// deleted until it is dropped.
pub struct SegmentSnapshot {
    tracker: Arc<SegmentTracker>,
    deleter: Option<SegmentDeleter>,
    segments: Vec<SegmentDescriptor>,
    version: u64,
}

impl fmt::Debug for SegmentSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentSnapshot")
            .field("segments", &self.segments)
            .field("version", &self.version)
            .finish()
    }
}

impl SegmentSnapshot {
    /// Segments visible in this snapshot.
    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    /// Generations visible in this snapshot.
    pub fn generations(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.generation).collect()
    }

    /// Segment-set version the snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Live documents across the snapshot.
    pub fn live_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.live_docs).sum()
    }

    /// Number of segments in the snapshot.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the snapshot holds no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Drop for SegmentSnapshot {
    fn drop(&mut self) {
        let ready = self.tracker.release(&self.generations());
        if ready.is_empty() {
            return;
        }
        if let Some(deleter) = &self.deleter {
            deleter(&ready);
        }
    }
}
