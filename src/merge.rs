//! Segment merging: policy, configuration, execution and scheduling.
//!
//! A [`MergePolicy`] looks at segment metadata and returns a
//! [`MergeSpecification`]. The [`MergeScheduler`] reserves the inputs and runs
//! each merge through a [`MergeExecutor`] on a worker thread, and the
//! [`SegmentSet`](crate::segment::SegmentSet) publishes the result.

pub mod config;
pub mod executor;
pub mod policy;
pub mod scheduler;
pub mod specification;

pub use config::{MergePolicyConfig, MergePolicySettings, SettingsState};
pub use executor::{MergeAbort, MergeExecutor, StorageMergeExecutor};
pub use policy::{MergePolicy, MergeTrigger, NoMergePolicy, TieredMergePolicy};
pub use scheduler::{CloseReport, MergeScheduler, SchedulerConfig, SchedulerStats, SubmitOutcome};
pub use specification::{MergeSpecification, OneMerge};
