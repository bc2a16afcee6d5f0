//! Segment metadata and the live segment set.
//!
//! A segment is an immutable unit of indexed data produced by a flush or a
//! merge. The merge core never looks inside a segment; it only needs the
//! numbers carried by [`SegmentDescriptor`].

pub mod set;
pub mod tracker;

use serde::{Deserialize, Serialize};

pub use set::{SegmentSet, SegmentSnapshot};
pub use tracker::SegmentTracker;

/// Immutable description of one on-disk segment.
///
/// Merging never changes a descriptor in place: a merge produces a new
/// descriptor with a fresh generation and retires its inputs. The only
/// change a live segment sees is new delete markers, which are applied by
/// swapping in a copy built with [`SegmentDescriptor::with_deletes`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Size of the segment in bytes.
    pub size_bytes: u64,

    /// Number of live (not deleted) documents.
    pub live_docs: u64,

    /// Number of documents marked deleted.
    pub deleted_docs: u64,

    /// Monotonically increasing segment identity.
    pub generation: u64,

    /// Whether delete markers are waiting to be applied to this segment.
    pub has_pending_deletes: bool,
}

impl SegmentDescriptor {
    /// Create a descriptor for a segment without deletions.
    pub fn new(generation: u64, size_bytes: u64, live_docs: u64) -> Self {
        SegmentDescriptor {
            size_bytes,
            live_docs,
            deleted_docs: 0,
            generation,
            has_pending_deletes: false,
        }
    }

    /// Builder-style setter for the deleted document count.
    pub fn with_deleted_docs(mut self, deleted_docs: u64) -> Self {
        self.deleted_docs = deleted_docs;
        self
    }

    /// Builder-style setter for the pending-deletes flag.
    pub fn with_pending_deletes(mut self, pending: bool) -> Self {
        self.has_pending_deletes = pending;
        self
    }

    /// A copy of this descriptor with `count` more documents deleted.
    /// Deletes beyond the number of live documents are ignored.
    pub fn with_deletes(&self, count: u64) -> Self {
        let applied = count.min(self.live_docs);
        SegmentDescriptor {
            live_docs: self.live_docs - applied,
            deleted_docs: self.deleted_docs + applied,
            has_pending_deletes: self.has_pending_deletes || applied > 0,
            ..self.clone()
        }
    }

    /// Live plus deleted documents.
    pub fn total_docs(&self) -> u64 {
        self.live_docs + self.deleted_docs
    }

    /// Fraction of documents that are deleted, in `[0, 1]`.
    pub fn deleted_ratio(&self) -> f64 {
        let total = self.total_docs();
        if total == 0 {
            0.0
        } else {
            self.deleted_docs as f64 / total as f64
        }
    }

    /// Percentage of documents that are deleted, in `[0, 100]`.
    pub fn deleted_pct(&self) -> f64 {
        self.deleted_ratio() * 100.0
    }

    /// Bytes attributable to live documents.
    pub fn live_bytes(&self) -> u64 {
        let live = (self.size_bytes as f64 * (1.0 - self.deleted_ratio())).round() as u64;
        live.min(self.size_bytes)
    }

    /// Bytes a merge would reclaim from this segment.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.size_bytes.saturating_sub(self.live_bytes())
    }

    /// Whether this segment carries any deletions, applied or pending.
    pub fn has_deletions(&self) -> bool {
        self.deleted_docs > 0 || self.has_pending_deletes
    }
}
