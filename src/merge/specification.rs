//! Merge plans returned by a merge policy.

use serde::{Deserialize, Serialize};

use crate::segment::SegmentDescriptor;

/// One group of segments to be merged into a single new segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneMerge {
    /// Input segments, at least one.
    pub segments: Vec<SegmentDescriptor>,

    /// Expected size of the output: the live bytes of the inputs.
    pub estimated_result_bytes: u64,

    /// Whether any input carries deletions.
    pub reclaims_deletes: bool,

    /// Whether the output should be written as a compound file.
    pub use_compound_file: bool,
}

impl OneMerge {
    /// Build a merge over `segments`. `total_index_bytes` and `no_cfs_ratio`
    /// decide the compound file flag: small outputs relative to the whole
    /// index are packed into a compound file.
    pub fn new(segments: Vec<SegmentDescriptor>, total_index_bytes: u64, no_cfs_ratio: f64) -> Self {
        let estimated_result_bytes = segments.iter().map(|s| s.live_bytes()).sum();
        let reclaims_deletes = segments.iter().any(|s| s.has_deletions());
        let use_compound_file = if no_cfs_ratio >= 1.0 {
            true
        } else if no_cfs_ratio <= 0.0 {
            false
        } else {
            estimated_result_bytes as f64 <= no_cfs_ratio * total_index_bytes as f64
        };

        OneMerge {
            segments,
            estimated_result_bytes,
            reclaims_deletes,
            use_compound_file,
        }
    }

    /// Generations of the inputs.
    pub fn generations(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.generation).collect()
    }

    /// Sum of the inputs' on-disk sizes.
    pub fn input_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// A set of merges that can run concurrently: no two share a segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OneMerge> {
        self.merges.iter()
    }

    /// Generations of every input, in plan order.
    pub fn segment_generations(&self) -> Vec<u64> {
        self.merges.iter().flat_map(|m| m.generations()).collect()
    }

    /// Total on-disk size of every input.
    pub fn total_input_bytes(&self) -> u64 {
        self.merges.iter().map(|m| m.input_bytes()).sum()
    }
}

impl IntoIterator for MergeSpecification {
    type Item = OneMerge;
    type IntoIter = std::vec::IntoIter<OneMerge>;

    fn into_iter(self) -> Self::IntoIter {
        self.merges.into_iter()
    }
}

impl<'a> IntoIterator for &'a MergeSpecification {
    type Item = &'a OneMerge;
    type IntoIter = std::slice::Iter<'a, OneMerge>;

    fn into_iter(self) -> Self::IntoIter {
        self.merges.iter()
    }
}
