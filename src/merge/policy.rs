//! Merge policies: deciding which segments to merge.
//!
//! A policy is a pure function of the live segments, the generations already
//! being merged and a config snapshot. It never touches storage and never
//! blocks, so it can run inline on the writer's thread.

use std::cmp::Ordering;
use std::fmt;

use ahash::AHashSet;
use log::debug;

use crate::merge::config::MergePolicyConfig;
use crate::merge::specification::{MergeSpecification, OneMerge};
use crate::segment::SegmentDescriptor;

/// Why the policy is being asked for merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTrigger {
    /// A flush, a finished merge or a settings refresh.
    Normal,

    /// Explicit request to shrink the index to at most `max_segments`.
    ForceMerge { max_segments: usize },

    /// Explicit request to rewrite segments with too many deletions.
    ExpungeDeletes,
}

/// Trait for defining merge policies.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Select merges. Segments in `merging` are never selected, and no two
    /// returned merges share a segment.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        segments: &[SegmentDescriptor],
        merging: &AHashSet<u64>,
        config: &MergePolicyConfig,
    ) -> MergeSpecification;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Policy that never merges.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _segments: &[SegmentDescriptor],
        _merging: &AHashSet<u64>,
        _config: &MergePolicyConfig,
    ) -> MergeSpecification {
        MergeSpecification::new()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Tiered merge policy.
///
/// Segments are bucketed into tiers of geometrically growing size. Each tier
/// may hold up to `segments_per_tier` segments; once the index holds more
/// segments than the tiers allow, the policy merges the group of similarly
/// sized segments with the lowest cost, where cost is the size skew of the
/// group minus a bonus for reclaiming deleted documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct TieredMergePolicy;

#[derive(Debug, Clone, Copy)]
struct Budget {
    allowed: usize,
    too_big: usize,
}

impl Budget {
    fn total(&self) -> usize {
        self.allowed.saturating_add(self.too_big)
    }
}

#[derive(Debug)]
struct Candidate {
    start: usize,
    members: Vec<usize>,
    raw_bytes: u64,
    cost: f64,
}

impl Candidate {
    /// Ordering used to pick the best candidate; `Less` means `self` wins.
    fn rank(&self, other: &Candidate) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| other.members.len().cmp(&self.members.len()))
            .then_with(|| self.raw_bytes.cmp(&other.raw_bytes))
            .then_with(|| self.start.cmp(&other.start))
    }
}

impl TieredMergePolicy {
    pub fn new() -> Self {
        TieredMergePolicy
    }

    /// Size used for selection: live bytes, rounded up to the floor.
    pub fn weighted_size(segment: &SegmentDescriptor, config: &MergePolicyConfig) -> u64 {
        segment.live_bytes().max(config.floor_segment_bytes())
    }

    /// Segments at least half the maximum merged size are left alone by
    /// normal merging.
    pub fn is_too_big(segment: &SegmentDescriptor, config: &MergePolicyConfig) -> bool {
        segment.live_bytes() >= config.max_merged_segment_bytes() / 2
    }

    /// Number of segments the index may hold before normal merging kicks in.
    pub fn segment_budget(segments: &[SegmentDescriptor], config: &MergePolicyConfig) -> usize {
        Self::budget(segments, config).total()
    }

    fn budget(segments: &[SegmentDescriptor], config: &MergePolicyConfig) -> Budget {
        let mut too_big = 0;
        let mut total_bytes = 0u64;
        let mut min_bytes = u64::MAX;
        for segment in segments {
            if Self::is_too_big(segment, config) {
                too_big += 1;
                continue;
            }
            let size = Self::weighted_size(segment, config);
            total_bytes = total_bytes.saturating_add(size);
            min_bytes = min_bytes.min(size);
        }

        let segments_per_tier = config.segments_per_tier();
        let max_merge_at_once = config.max_merge_at_once() as f64;
        let max_merged = config.max_merged_segment_bytes() as f64;

        let mut allowed = 0.0;
        if total_bytes > 0 {
            let mut level = min_bytes as f64;
            let mut bytes_left = total_bytes as f64;
            loop {
                let count = bytes_left / level;
                if count < segments_per_tier {
                    allowed += count.ceil();
                    break;
                }
                allowed += segments_per_tier;
                bytes_left -= segments_per_tier * level;
                level = (level * max_merge_at_once).min(max_merged);
            }
        }
        let allowed = allowed.max(segments_per_tier).ceil() as usize;

        Budget { allowed, too_big }
    }

    fn normal_merges(
        &self,
        segments: &[SegmentDescriptor],
        merging: &AHashSet<u64>,
        config: &MergePolicyConfig,
    ) -> MergeSpecification {
        let budget = Self::budget(segments, config);
        if segments.len() <= budget.total() {
            return MergeSpecification::new();
        }

        let mut eligible: Vec<&SegmentDescriptor> = segments
            .iter()
            .filter(|s| !merging.contains(&s.generation) && !Self::is_too_big(s, config))
            .collect();
        eligible.sort_by(|a, b| {
            Self::weighted_size(b, config)
                .cmp(&Self::weighted_size(a, config))
                .then_with(|| a.generation.cmp(&b.generation))
        });

        let total_index_bytes = total_bytes(segments);
        let mut spec = MergeSpecification::new();
        while eligible.len() > budget.allowed {
            let Some(best) = self.best_candidate(&eligible, config) else {
                break;
            };
            let chosen: Vec<SegmentDescriptor> =
                best.members.iter().map(|&idx| eligible[idx].clone()).collect();
            debug!(
                "tiered merge of {} segments ({} bytes, cost {:.3}), {} eligible, {} allowed",
                chosen.len(),
                best.raw_bytes,
                best.cost,
                eligible.len(),
                budget.allowed
            );

            let mut idx = 0;
            eligible.retain(|_| {
                let keep = !best.members.contains(&idx);
                idx += 1;
                keep
            });
            spec.add(OneMerge::new(chosen, total_index_bytes, config.no_cfs_ratio()));
        }
        spec
    }

    fn best_candidate(
        &self,
        eligible: &[&SegmentDescriptor],
        config: &MergePolicyConfig,
    ) -> Option<Candidate> {
        let width = (config.max_merge_at_once() as usize).min(eligible.len());
        let max_merged = config.max_merged_segment_bytes();

        let mut best_multi: Option<Candidate> = None;
        let mut best_single: Option<Candidate> = None;
        for start in 0..=eligible.len().saturating_sub(width) {
            let mut members = Vec::with_capacity(width);
            let mut raw_bytes = 0u64;
            for (idx, segment) in eligible.iter().enumerate().skip(start) {
                if members.len() >= width {
                    break;
                }
                if raw_bytes + segment.size_bytes > max_merged {
                    continue;
                }
                members.push(idx);
                raw_bytes += segment.size_bytes;
            }
            if members.is_empty() {
                continue;
            }

            let candidate = Candidate {
                cost: Self::cost(eligible, &members, config),
                start,
                members,
                raw_bytes,
            };
            let slot = if candidate.members.len() >= 2 {
                &mut best_multi
            } else if eligible[candidate.members[0]].has_deletions() {
                &mut best_single
            } else {
                continue;
            };
            let better = slot
                .as_ref()
                .is_none_or(|current| candidate.rank(current) == Ordering::Less);
            if better {
                *slot = Some(candidate);
            }
        }
        best_multi.or(best_single)
    }

    fn cost(eligible: &[&SegmentDescriptor], members: &[usize], config: &MergePolicyConfig) -> f64 {
        let mut largest = 0u64;
        let mut smallest = u64::MAX;
        let mut deleted = 0u64;
        let mut total = 0u64;
        for &idx in members {
            let segment = eligible[idx];
            let size = Self::weighted_size(segment, config);
            largest = largest.max(size);
            smallest = smallest.min(size);
            deleted += segment.deleted_docs;
            total += segment.total_docs();
        }
        let skew = largest as f64 / smallest.max(1) as f64;
        let deleted_ratio = if total == 0 {
            0.0
        } else {
            deleted as f64 / total as f64
        };
        skew - config.reclaim_deletes_weight() * deleted_ratio
    }

    fn expunge_deletes_merges(
        &self,
        segments: &[SegmentDescriptor],
        merging: &AHashSet<u64>,
        config: &MergePolicyConfig,
    ) -> MergeSpecification {
        let allowed_pct = config.expunge_deletes_allowed_pct();
        let mut eligible: Vec<&SegmentDescriptor> = segments
            .iter()
            .filter(|s| !merging.contains(&s.generation) && s.deleted_pct() > allowed_pct)
            .collect();
        eligible.sort_by(|a, b| {
            b.live_bytes()
                .cmp(&a.live_bytes())
                .then_with(|| a.generation.cmp(&b.generation))
        });

        let total_index_bytes = total_bytes(segments);
        let max_at_once = config.max_merge_at_once_explicit() as usize;
        let cap = config.max_merged_segment_bytes();

        let mut groups: Vec<Vec<SegmentDescriptor>> = Vec::new();
        let mut current: Vec<SegmentDescriptor> = Vec::new();
        let mut current_bytes = 0u64;
        for segment in eligible {
            let live = segment.live_bytes();
            if live > cap {
                groups.push(vec![segment.clone()]);
                continue;
            }
            if current.len() >= max_at_once || current_bytes + live > cap {
                groups.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += live;
            current.push(segment.clone());
        }
        if !current.is_empty() {
            groups.push(current);
        }

        debug!(
            "expunge deletes: {} merges over segments above {allowed_pct}% deleted",
            groups.len()
        );
        let mut spec = MergeSpecification::new();
        for group in groups {
            spec.add(OneMerge::new(group, total_index_bytes, config.no_cfs_ratio()));
        }
        spec
    }

    fn forced_merges(
        &self,
        max_segments: usize,
        segments: &[SegmentDescriptor],
        merging: &AHashSet<u64>,
        config: &MergePolicyConfig,
    ) -> MergeSpecification {
        let max_segments = max_segments.max(1);
        let mut eligible: Vec<&SegmentDescriptor> = segments
            .iter()
            .filter(|s| !merging.contains(&s.generation))
            .collect();
        let total_index_bytes = total_bytes(segments);
        let mut spec = MergeSpecification::new();

        if eligible.len() <= max_segments {
            if max_segments == 1 && eligible.len() == 1 && eligible[0].has_deletions() {
                spec.add(OneMerge::new(
                    vec![eligible[0].clone()],
                    total_index_bytes,
                    config.no_cfs_ratio(),
                ));
            }
            return spec;
        }

        eligible.sort_by(|a, b| {
            b.size_bytes
                .cmp(&a.size_bytes)
                .then_with(|| a.generation.cmp(&b.generation))
        });

        let max_at_once = config.max_merge_at_once_explicit() as usize;
        let mut end = eligible.len();
        while end >= max_at_once + max_segments - 1 {
            let group = eligible[end - max_at_once..end]
                .iter()
                .map(|s| (*s).clone())
                .collect();
            spec.add(OneMerge::new(group, total_index_bytes, config.no_cfs_ratio()));
            end -= max_at_once;
        }

        if spec.is_empty() {
            // Too few segments for a full merge: fold the smallest ones so
            // exactly `max_segments` remain.
            let count = end - max_segments + 1;
            let group = eligible[end - count..end]
                .iter()
                .map(|s| (*s).clone())
                .collect();
            spec.add(OneMerge::new(group, total_index_bytes, config.no_cfs_ratio()));
        }

        debug!(
            "force merge to {max_segments} segments: {} merges over {} segments",
            spec.len(),
            spec.segment_generations().len()
        );
        spec
    }
}

fn total_bytes(segments: &[SegmentDescriptor]) -> u64 {
    segments.iter().map(|s| s.size_bytes).sum()
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        segments: &[SegmentDescriptor],
        merging: &AHashSet<u64>,
        config: &MergePolicyConfig,
    ) -> MergeSpecification {
        if !config.is_merging_enabled() || segments.is_empty() {
            return MergeSpecification::new();
        }
        match trigger {
            MergeTrigger::Normal => self.normal_merges(segments, merging, config),
            MergeTrigger::ExpungeDeletes => self.expunge_deletes_merges(segments, merging, config),
            MergeTrigger::ForceMerge { max_segments } => {
                self.forced_merges(max_segments, segments, merging, config)
            }
        }
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}
