//! Selection tests for the tiered merge policy.

use ahash::AHashSet;
use phalanx::merge::{
    MergePolicy, MergePolicyConfig, MergeSpecification, MergeTrigger, TieredMergePolicy,
};
use phalanx::segment::SegmentDescriptor;
use phalanx::settings::{MAX_MERGE_AT_ONCE, SEGMENTS_PER_TIER, Settings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

const MB: u64 = 1024 * 1024;

fn uniform(count: usize, size: u64) -> Vec<SegmentDescriptor> {
    (1..=count as u64)
        .map(|generation| SegmentDescriptor::new(generation, size, 1000))
        .collect()
}

fn random_segments(rng: &mut StdRng, count: usize) -> Vec<SegmentDescriptor> {
    (1..=count as u64)
        .map(|generation| {
            let size = rng.random_range(MB / 4..200 * MB);
            let live = rng.random_range(100..10_000);
            let segment = SegmentDescriptor::new(generation, size, live);
            if rng.random_bool(0.3) {
                segment.with_deletes(rng.random_range(0..live))
            } else {
                segment
            }
        })
        .collect()
}

fn find(
    trigger: MergeTrigger,
    segments: &[SegmentDescriptor],
    config: &MergePolicyConfig,
) -> MergeSpecification {
    TieredMergePolicy::new().find_merges(trigger, segments, &AHashSet::new(), config)
}

/// Replace every merged group with one output segment.
fn apply(
    segments: &mut Vec<SegmentDescriptor>,
    spec: &MergeSpecification,
    next_generation: &mut u64,
) {
    for merge in spec {
        let inputs: HashSet<u64> = merge.generations().into_iter().collect();
        segments.retain(|s| !inputs.contains(&s.generation));
        let live_docs = merge.segments.iter().map(|s| s.live_docs).sum();
        segments.push(SegmentDescriptor::new(
            *next_generation,
            merge.estimated_result_bytes,
            live_docs,
        ));
        *next_generation += 1;
    }
}

fn assert_disjoint(spec: &MergeSpecification) {
    let generations = spec.segment_generations();
    let unique: HashSet<u64> = generations.iter().copied().collect();
    assert_eq!(unique.len(), generations.len(), "overlapping merges: {spec:?}");
}

#[test]
fn test_segments_per_tier_never_below_max_merge_at_once() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let mut config = MergePolicyConfig::default();
        config.set_max_merge_at_once(rng.random_range(0..50));
        config.set_segments_per_tier(rng.random_range(0.0..50.0));
        assert!(config.segments_per_tier() >= config.max_merge_at_once() as f64);

        config.set_max_merge_at_once(rng.random_range(0..50));
        assert!(config.segments_per_tier() >= config.max_merge_at_once() as f64);
    }
}

#[test]
fn test_within_budget_returns_nothing() {
    let mut rng = StdRng::seed_from_u64(11);
    let config = MergePolicyConfig::default();
    for _ in 0..200 {
        let count = rng.random_range(0..40);
        let segments = random_segments(&mut rng, count);
        if segments.len() <= TieredMergePolicy::segment_budget(&segments, &config) {
            assert!(find(MergeTrigger::Normal, &segments, &config).is_empty());
        }
    }
}

#[test]
fn test_selection_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(13);
    let config = MergePolicyConfig::default();
    for _ in 0..100 {
        let count = rng.random_range(1..80);
        let segments = random_segments(&mut rng, count);
        for trigger in [
            MergeTrigger::Normal,
            MergeTrigger::ExpungeDeletes,
            MergeTrigger::ForceMerge { max_segments: 3 },
        ] {
            let first = find(trigger, &segments, &config);
            let second = find(trigger, &segments, &config);
            assert_eq!(first, second);
        }
    }
}

#[test]
fn test_merges_never_overlap() {
    let mut rng = StdRng::seed_from_u64(17);
    let mut config = MergePolicyConfig::default();
    config.set_max_merge_at_once_explicit(4);
    for _ in 0..100 {
        let count = rng.random_range(1..120);
        let segments = random_segments(&mut rng, count);
        assert_disjoint(&find(MergeTrigger::Normal, &segments, &config));
        assert_disjoint(&find(MergeTrigger::ExpungeDeletes, &segments, &config));
        assert_disjoint(&find(
            MergeTrigger::ForceMerge { max_segments: 1 },
            &segments,
            &config,
        ));
    }
}

#[test]
fn test_normal_merges_respect_max_merged_size() {
    let mut rng = StdRng::seed_from_u64(19);
    let mut config = MergePolicyConfig::default();
    config.set_max_merged_segment_bytes(300 * MB);
    for _ in 0..100 {
        let count = rng.random_range(1..120);
        let segments = random_segments(&mut rng, count);
        for merge in &find(MergeTrigger::Normal, &segments, &config) {
            if merge.len() >= 2 {
                assert!(merge.input_bytes() <= config.max_merged_segment_bytes());
            } else {
                assert!(merge.reclaims_deletes);
            }
            assert!(merge.len() <= config.max_merge_at_once() as usize);
        }
    }
}

#[test]
fn test_merging_segments_are_never_selected() {
    let mut rng = StdRng::seed_from_u64(23);
    let config = MergePolicyConfig::default();
    for _ in 0..50 {
        let segments = random_segments(&mut rng, 60);
        let merging: AHashSet<u64> = segments
            .iter()
            .filter(|_| rng.random_bool(0.25))
            .map(|s| s.generation)
            .collect();
        for trigger in [
            MergeTrigger::Normal,
            MergeTrigger::ExpungeDeletes,
            MergeTrigger::ForceMerge { max_segments: 1 },
        ] {
            let spec = TieredMergePolicy::new().find_merges(trigger, &segments, &merging, &config);
            assert!(spec.segment_generations().iter().all(|g| !merging.contains(g)));
        }
    }
}

#[test]
fn test_empty_input_yields_empty_spec() {
    let config = MergePolicyConfig::default();
    for trigger in [
        MergeTrigger::Normal,
        MergeTrigger::ExpungeDeletes,
        MergeTrigger::ForceMerge { max_segments: 1 },
        MergeTrigger::ForceMerge { max_segments: 0 },
    ] {
        assert!(find(trigger, &[], &config).is_empty());
    }
}

#[test]
fn test_equal_segments_merge_toward_budget() {
    let config = MergePolicyConfig::default();
    let segments = uniform(12, 10 * MB);

    let spec = find(MergeTrigger::Normal, &segments, &config);
    assert_eq!(spec.len(), 1);
    let merge = &spec.merges[0];
    assert!(merge.len() <= 10 && merge.len() >= 2);
    assert_eq!(merge.estimated_result_bytes, merge.len() as u64 * 10 * MB);

    let mut after = segments.clone();
    let mut next_generation = 13;
    apply(&mut after, &spec, &mut next_generation);
    assert!(after.len() <= TieredMergePolicy::segment_budget(&after, &config));
    assert!(find(MergeTrigger::Normal, &after, &config).is_empty());
}

#[test]
fn test_heavily_deleted_segment_is_expunged_but_not_merged_alone() {
    let config = MergePolicyConfig::default();
    let segments = vec![SegmentDescriptor::new(1, 100 * MB, 200).with_deleted_docs(800)];
    assert!(segments[0].deleted_pct() > config.expunge_deletes_allowed_pct());

    let spec = find(MergeTrigger::ExpungeDeletes, &segments, &config);
    assert_eq!(spec.len(), 1);
    assert_eq!(spec.merges[0].generations(), vec![1]);
    assert!(spec.merges[0].reclaims_deletes);
    assert_eq!(spec.merges[0].estimated_result_bytes, 20 * MB);

    assert!(find(MergeTrigger::Normal, &segments, &config).is_empty());
}

#[test]
fn test_segments_per_tier_clamps_max_merge_at_once() {
    let mut config = MergePolicyConfig::from_settings(
        &Settings::new().with(MAX_MERGE_AT_ONCE, "10"),
    )
    .unwrap();
    assert_eq!(config.max_merge_at_once(), 10);

    assert!(config.update(SEGMENTS_PER_TIER, "5").unwrap());
    assert_eq!(config.segments_per_tier(), 5.0);
    assert_eq!(config.max_merge_at_once(), 5);
    assert_eq!(config.requested_max_merge_at_once(), 10);

    // Raising the tier size again restores the requested value.
    assert!(config.update(SEGMENTS_PER_TIER, "20").unwrap());
    assert_eq!(config.max_merge_at_once(), 10);
}

#[test]
fn test_expunge_groups_respect_explicit_limit() {
    let mut config = MergePolicyConfig::default();
    config.set_max_merge_at_once_explicit(2);
    let mut segments: Vec<SegmentDescriptor> = (1..=5)
        .map(|g| SegmentDescriptor::new(g, 10 * MB, 500).with_deleted_docs(500))
        .collect();
    segments.push(SegmentDescriptor::new(6, 10 * MB, 1000).with_deleted_docs(10));

    let spec = find(MergeTrigger::ExpungeDeletes, &segments, &config);
    let sizes: Vec<usize> = spec.iter().map(|m| m.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(!spec.segment_generations().contains(&6));
}

#[test]
fn test_expunge_groups_respect_max_merged_size() {
    let mut config = MergePolicyConfig::default();
    config.set_max_merged_segment_bytes(100 * MB);
    let segments: Vec<SegmentDescriptor> = (1..=4)
        .map(|g| SegmentDescriptor::new(g, 120 * MB, 500).with_deleted_docs(500))
        .collect();

    let spec = find(MergeTrigger::ExpungeDeletes, &segments, &config);
    for merge in &spec {
        assert!(merge.estimated_result_bytes <= 100 * MB);
    }
    assert_eq!(spec.segment_generations().len(), 4);
}

#[test]
fn test_force_merge_converges_to_one_segment() {
    let config = MergePolicyConfig::default();
    let mut segments = uniform(40, 10 * MB);
    let mut next_generation = 41;

    let mut rounds = 0;
    loop {
        let spec = find(
            MergeTrigger::ForceMerge { max_segments: 1 },
            &segments,
            &config,
        );
        if spec.is_empty() {
            break;
        }
        for merge in &spec {
            assert!(merge.len() <= config.max_merge_at_once_explicit() as usize);
        }
        apply(&mut segments, &spec, &mut next_generation);
        rounds += 1;
        assert!(rounds < 10, "force merge did not converge");
    }

    assert_eq!(segments.len(), 1);
    assert_eq!(rounds, 2);
    assert_eq!(segments[0].size_bytes, 400 * MB);
}

#[test]
fn test_force_merge_to_several_segments_folds_smallest() {
    let config = MergePolicyConfig::default();
    let segments: Vec<SegmentDescriptor> = [50, 40, 30, 20, 10]
        .iter()
        .enumerate()
        .map(|(i, &size)| SegmentDescriptor::new(i as u64 + 1, size * MB, 100))
        .collect();

    let spec = find(
        MergeTrigger::ForceMerge { max_segments: 3 },
        &segments,
        &config,
    );
    assert_eq!(spec.len(), 1);
    assert_eq!(spec.merges[0].generations(), vec![3, 4, 5]);
}

#[test]
fn test_force_merge_single_segment() {
    let config = MergePolicyConfig::default();
    let clean = vec![SegmentDescriptor::new(1, 10 * MB, 100)];
    assert!(
        find(MergeTrigger::ForceMerge { max_segments: 1 }, &clean, &config).is_empty()
    );

    let deleted = vec![clean[0].with_deletes(10)];
    let spec = find(MergeTrigger::ForceMerge { max_segments: 1 }, &deleted, &config);
    assert_eq!(spec.segment_generations(), vec![1]);
}

#[test]
fn test_normal_merging_terminates() {
    let mut rng = StdRng::seed_from_u64(29);
    let config = MergePolicyConfig::default();
    for _ in 0..20 {
        let mut segments = random_segments(&mut rng, 150);
        let mut next_generation = 1000;
        let mut rounds = 0;
        loop {
            let spec = find(MergeTrigger::Normal, &segments, &config);
            if spec.is_empty() {
                break;
            }
            let before = segments.len();
            apply(&mut segments, &spec, &mut next_generation);
            assert!(segments.len() <= before);
            rounds += 1;
            assert!(rounds < 100, "normal merging did not settle");
        }
        assert!(segments.len() < 150);
    }
}
