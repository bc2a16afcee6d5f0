//! # Phalanx
//!
//! A tiered segment merge policy and background merge scheduler for
//! log-structured search indexes.
//!
//! ## Features
//!
//! - Tiered merge selection with a segment budget, size skew scoring and
//!   deletion reclaim
//! - Force merge and expunge-deletes passes
//! - Live, atomically swapped merge settings
//! - Bounded background merge scheduler with per-segment reservations
//! - Reference-counted segment snapshots for readers
//! - Pluggable storage backends for the bundled merge executor

pub mod error;
pub mod event;
pub mod merge;
pub mod merger;
pub mod segment;
pub mod settings;
pub mod storage;

pub mod prelude {
    pub use crate::error::{PhalanxError, Result};
    pub use crate::event::{EngineEvent, EngineEventListener};
    pub use crate::merge::{
        MergePolicy, MergePolicyConfig, MergeSpecification, MergeTrigger, OneMerge,
        TieredMergePolicy,
    };
    pub use crate::merger::IndexMerger;
    pub use crate::segment::{SegmentDescriptor, SegmentSet};
    pub use crate::settings::Settings;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
