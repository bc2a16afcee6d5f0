//! The entry points an index writer uses to drive merging.
//!
//! [`IndexMerger`] wires the segment set, the live policy settings, the merge
//! policy and the scheduler together. Every trigger (a flush, an explicit
//! force merge or expunge, a settings change) runs the policy synchronously
//! against a consistent view of the segments and hands the result to the
//! scheduler, which returns immediately.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use phalanx::event::NoopEventListener;
//! use phalanx::merge::StorageMergeExecutor;
//! use phalanx::merger::IndexMerger;
//! use phalanx::segment::{SegmentDescriptor, SegmentSet};
//! use phalanx::settings::Settings;
//! use phalanx::storage::{MemoryStorage, segment_file_name};
//!
//! # fn main() -> phalanx::error::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let merger = IndexMerger::new(
//!     &Settings::new(),
//!     Arc::new(SegmentSet::new()),
//!     Arc::new(StorageMergeExecutor::new(storage.clone())),
//!     Arc::new(NoopEventListener),
//! )?;
//!
//! let generation = merger.next_generation();
//! storage.put_file(&segment_file_name(generation), vec![0; 1024]);
//! merger.on_flush(SegmentDescriptor::new(generation, 1024, 10))?;
//!
//! merger.wait_for_merges(Duration::from_secs(5));
//! merger.close("done", true);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error};

use crate::error::{PhalanxError, Result};
use crate::event::{EngineEvent, EngineEventListener};
use crate::merge::config::{MergePolicyConfig, MergePolicySettings};
use crate::merge::executor::MergeExecutor;
use crate::merge::policy::{MergePolicy, MergeTrigger, TieredMergePolicy};
use crate::merge::scheduler::{
    CloseReport, MergeScheduler, SchedulerConfig, SchedulerStats, SubmitOutcome,
};
use crate::merge::specification::MergeSpecification;
use crate::segment::{SegmentDescriptor, SegmentSet, SegmentSnapshot};
use crate::settings::Settings;

/// Finds merges with the current config against a consistent segment view.
#[derive(Clone)]
struct PolicyRunner {
    segments: Arc<SegmentSet>,
    settings: Arc<MergePolicySettings>,
    policy: Arc<dyn MergePolicy>,
}

impl PolicyRunner {
    fn find(&self, trigger: MergeTrigger) -> MergeSpecification {
        let config = self.settings.snapshot();
        let (segments, merging) = self.segments.merge_view();
        let spec = self
            .policy
            .find_merges(trigger, &segments, &merging, &config);
        debug!(
            "{} policy found {} merges for {trigger:?} over {} segments",
            self.policy.name(),
            spec.len(),
            segments.len()
        );
        spec
    }
}

/// Merge trigger entry points for an index writer.
pub struct IndexMerger {
    finder: PolicyRunner,
    scheduler: MergeScheduler,
    listener: Arc<dyn EngineEventListener>,
    closed: AtomicBool,
}

impl fmt::Debug for IndexMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexMerger")
            .field("segments", &self.finder.segments)
            .field("policy", &self.finder.policy)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl IndexMerger {
    /// Create a merger with the tiered policy, configured from `settings`.
    pub fn new(
        settings: &Settings,
        segments: Arc<SegmentSet>,
        executor: Arc<dyn MergeExecutor>,
        listener: Arc<dyn EngineEventListener>,
    ) -> Result<Self> {
        Self::with_components(
            MergePolicyConfig::from_settings(settings)?,
            SchedulerConfig::from_settings(settings),
            Arc::new(TieredMergePolicy::new()),
            segments,
            executor,
            listener,
        )
    }

    /// Create a merger from explicit parts.
    pub fn with_components(
        config: MergePolicyConfig,
        scheduler_config: SchedulerConfig,
        policy: Arc<dyn MergePolicy>,
        segments: Arc<SegmentSet>,
        executor: Arc<dyn MergeExecutor>,
        listener: Arc<dyn EngineEventListener>,
    ) -> Result<Self> {
        let deleter = Arc::clone(&executor);
        segments.set_deleter(Arc::new(move |generations: &[u64]| {
            if let Err(e) = deleter.delete_segments(generations) {
                error!("failed to delete retired segments {generations:?}: {e}");
            }
        }));

        let finder = PolicyRunner {
            segments: Arc::clone(&segments),
            settings: Arc::new(MergePolicySettings::new(config, Arc::clone(&listener))),
            policy,
        };
        let scheduler = MergeScheduler::new(
            scheduler_config,
            segments,
            executor,
            Arc::clone(&listener),
        )?;

        let cascade = finder.clone();
        scheduler.set_cascade(Arc::new(move || cascade.find(MergeTrigger::Normal)));

        Ok(IndexMerger {
            finder,
            scheduler,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    /// Register a freshly flushed segment and merge if the index is over
    /// budget.
    pub fn on_flush(&self, segment: SegmentDescriptor) -> Result<SubmitOutcome> {
        self.ensure_open()?;
        self.finder.segments.add(segment)?;
        self.segment_set_changed();
        Ok(self.maybe_merge())
    }

    /// Run the policy in normal mode and schedule whatever it selects.
    pub fn maybe_merge(&self) -> SubmitOutcome {
        self.trigger(MergeTrigger::Normal)
    }

    /// Merge down to at most `max_segments` segments. Large indexes may need
    /// several calls; each call makes progress.
    pub fn force_merge(&self, max_segments: usize) -> Result<SubmitOutcome> {
        self.ensure_open()?;
        Ok(self.trigger(MergeTrigger::ForceMerge { max_segments }))
    }

    /// Rewrite segments whose deleted percentage is above the configured
    /// threshold.
    pub fn expunge_deletes(&self) -> Result<SubmitOutcome> {
        self.ensure_open()?;
        Ok(self.trigger(MergeTrigger::ExpungeDeletes))
    }

    /// Apply every merge setting present in `settings`; merges again when
    /// anything changed. Returns the changed keys.
    pub fn refresh_settings(&self, settings: &Settings) -> Result<Vec<String>> {
        let changed = self.finder.settings.refresh(settings)?;
        if !changed.is_empty() {
            self.maybe_merge();
        }
        Ok(changed)
    }

    /// Change one merge setting; merges again when it took effect.
    pub fn update_setting(&self, key: &str, value: &str) -> Result<bool> {
        let changed = self.finder.settings.update(key, value)?;
        if changed {
            self.maybe_merge();
        }
        Ok(changed)
    }

    /// Mark documents of a live segment as deleted.
    pub fn apply_deletes(&self, generation: u64, count: u64) -> Result<SegmentDescriptor> {
        self.ensure_open()?;
        let updated = self.finder.segments.apply_deletes(generation, count)?;
        self.segment_set_changed();
        Ok(updated)
    }

    /// Stop merging. Idempotent; later calls return the first report.
    pub fn close(&self, reason: &str, await_running_merges: bool) -> CloseReport {
        self.closed.store(true, Ordering::Release);
        self.finder.settings.close();
        self.scheduler.close(reason, await_running_merges)
    }

    /// Block until no merge is queued or running.
    pub fn wait_for_merges(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_idle(timeout)
    }

    pub fn snapshot(&self) -> SegmentSnapshot {
        self.finder.segments.snapshot()
    }

    pub fn segments(&self) -> Vec<SegmentDescriptor> {
        self.finder.segments.segments()
    }

    pub fn segment_set(&self) -> &Arc<SegmentSet> {
        &self.finder.segments
    }

    /// Allocate a generation for the next flushed segment.
    pub fn next_generation(&self) -> u64 {
        self.finder.segments.next_generation()
    }

    /// The config the next policy run will use.
    pub fn config(&self) -> Arc<MergePolicyConfig> {
        self.finder.settings.snapshot()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn trigger(&self, trigger: MergeTrigger) -> SubmitOutcome {
        if self.is_closed() {
            return SubmitOutcome::Rejected;
        }
        self.scheduler.submit(self.finder.find(trigger))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(PhalanxError::closed("index merger is closed"))
        } else {
            Ok(())
        }
    }

    fn segment_set_changed(&self) {
        let segments = &self.finder.segments;
        self.listener.on_event(&EngineEvent::SegmentSetChanged {
            total_bytes: segments.total_bytes(),
            segment_count: segments.len(),
        });
    }
}
