//! Engine lifecycle events emitted by the merge core.
//!
//! Everything observable about merging (merges starting and finishing, the
//! live segment set changing, settings being applied) flows through one
//! [`EngineEvent`] enum delivered to an [`EngineEventListener`]. Listeners are
//! called on the thread that produced the event, so they must be cheap and
//! must not call back into the merger.

use std::fmt;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::segment::SegmentDescriptor;

/// Something that happened inside the merge core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A merge was picked up by a worker.
    MergeStarted {
        merge_id: u64,
        segments: Vec<u64>,
    },

    /// A merge output was published.
    MergeCompleted {
        merge_id: u64,
        output: SegmentDescriptor,
        reclaimed_bytes: u64,
    },

    /// A merge failed or was aborted. Its inputs are still live.
    MergeFailed {
        merge_id: u64,
        segments: Vec<u64>,
        reason: String,
    },

    /// The live segment set changed.
    SegmentSetChanged {
        total_bytes: u64,
        segment_count: usize,
    },

    /// A merge setting took a new effective value.
    SettingsUpdated { key: String, value: String },
}

impl EngineEvent {
    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::MergeStarted { .. } => "merge_started",
            EngineEvent::MergeCompleted { .. } => "merge_completed",
            EngineEvent::MergeFailed { .. } => "merge_failed",
            EngineEvent::SegmentSetChanged { .. } => "segment_set_changed",
            EngineEvent::SettingsUpdated { .. } => "settings_updated",
        }
    }
}

/// Receiver of engine events.
pub trait EngineEventListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &EngineEvent);
}

/// Listener that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventListener;

impl EngineEventListener for NoopEventListener {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Listener that forwards events into a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelEventListener {
    sender: Sender<EngineEvent>,
}

impl ChannelEventListener {
    /// Create a listener and the receiving end of its channel.
    pub fn new() -> (Self, Receiver<EngineEvent>) {
        let (sender, receiver) = unbounded();
        (ChannelEventListener { sender }, receiver)
    }

    /// Wrap an existing sender.
    pub fn with_sender(sender: Sender<EngineEvent>) -> Self {
        ChannelEventListener { sender }
    }
}

impl EngineEventListener for ChannelEventListener {
    fn on_event(&self, event: &EngineEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.sender.send(event.clone());
    }
}

/// Listener backed by a closure.
pub struct FnEventListener<F>
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    callback: F,
}

impl<F> FnEventListener<F>
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    /// Create a listener that calls `callback` for every event.
    pub fn new(callback: F) -> Self {
        FnEventListener { callback }
    }
}

impl<F> fmt::Debug for FnEventListener<F>
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEventListener").finish_non_exhaustive()
    }
}

impl<F> EngineEventListener for FnEventListener<F>
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        (self.callback)(event)
    }
}
