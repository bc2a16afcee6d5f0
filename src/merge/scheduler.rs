//! Background merge execution.
//!
//! The scheduler runs merges on a fixed pool of named worker threads fed by
//! a crossbeam channel. Submitting never blocks on I/O: each merge in a
//! specification is either reserved and queued, deferred until a running
//! merge finishes, or dropped because one of its inputs is gone.
//!
//! # Locking model
//!
//! ```text
//! Lock ordering (acquire in this order):
//!   1. state             - parking_lot::Mutex, bookkeeping only
//!   2. SegmentSet.state  - parking_lot::Mutex, bookkeeping only
//!
//! sender               - parking_lot::Mutex, may be taken under state
//! workers, cascade     - parking_lot::Mutex, never held with state
//! ```
//!
//! Merge I/O and listener callbacks run with no lock held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{PhalanxError, Result};
use crate::event::{EngineEvent, EngineEventListener};
use crate::merge::executor::{MergeAbort, MergeExecutor};
use crate::merge::specification::{MergeSpecification, OneMerge};
use crate::segment::SegmentDescriptor;
use crate::segment::set::{Reservation, SegmentSet};
use crate::settings::{SCHEDULER_MAX_MERGE_COUNT, SCHEDULER_MAX_THREAD_COUNT, Settings};

/// Produces follow-up merges after a merge has been published.
pub type MergeFinder = Arc<dyn Fn() -> MergeSpecification + Send + Sync>;

/// Configuration for the merge scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub max_thread_count: usize,

    /// Maximum number of merges queued or running at once. Further merges
    /// are deferred.
    pub max_merge_count: usize,

    /// How long `close` waits for running merges before aborting them.
    pub close_grace_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
        SchedulerConfig {
            max_thread_count,
            max_merge_count: max_thread_count + 5,
            close_grace_period: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Read `index.merge.scheduler.*` settings, falling back to the defaults.
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = SchedulerConfig::default();
        let max_thread_count = settings
            .get_as_u32(SCHEDULER_MAX_THREAD_COUNT, defaults.max_thread_count as u32)
            .max(1) as usize;
        let max_merge_count = settings
            .get_as_u32(SCHEDULER_MAX_MERGE_COUNT, (max_thread_count + 5) as u32)
            as usize;
        SchedulerConfig {
            max_thread_count,
            max_merge_count: max_merge_count.max(max_thread_count),
            close_grace_period: defaults.close_grace_period,
        }
    }

    /// Builder-style setter for the close grace period.
    pub fn with_close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }
}

/// What happened to the merges of one submitted specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted {
        /// Reserved and handed to the workers.
        queued: usize,
        /// Waiting for a running merge to finish.
        deferred: usize,
        /// Discarded because an input is no longer live.
        dropped: usize,
    },

    /// The scheduler is shutting down; nothing was scheduled.
    Rejected,
}

impl SubmitOutcome {
    pub fn queued(&self) -> usize {
        match self {
            SubmitOutcome::Accepted { queued, .. } => *queued,
            SubmitOutcome::Rejected => 0,
        }
    }

    pub fn deferred(&self) -> usize {
        match self {
            SubmitOutcome::Accepted { deferred, .. } => *deferred,
            SubmitOutcome::Rejected => 0,
        }
    }

    pub fn dropped(&self) -> usize {
        match self {
            SubmitOutcome::Accepted { dropped, .. } => *dropped,
            SubmitOutcome::Rejected => 0,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SubmitOutcome::Rejected)
    }
}

/// Summary of what `close` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReport {
    /// Queued or deferred merges that never started.
    pub cancelled: usize,

    /// Running merges that were aborted.
    pub aborted: usize,

    /// Running merges that published while the scheduler was closing.
    pub completed_while_closing: usize,
}

/// Statistics about merge execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Merges submitted.
    pub submitted: u64,

    /// Merges currently running.
    pub running: u64,

    /// Merges reserved and waiting for a worker.
    pub queued: u64,

    /// Merges waiting for their inputs or for a free slot.
    pub deferred: u64,

    /// Merges published.
    pub completed: u64,

    /// Merges that failed.
    pub failed: u64,

    /// Merges aborted during close.
    pub aborted: u64,

    /// Merges cancelled before they started.
    pub cancelled: u64,

    /// Merges dropped because an input was already gone.
    pub dropped: u64,

    /// Input bytes of published merges.
    pub bytes_merged: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct MergeTask {
    id: u64,
    inputs: Vec<SegmentDescriptor>,
    abort: MergeAbort,
}

impl MergeTask {
    fn generations(&self) -> Vec<u64> {
        self.inputs.iter().map(|s| s.generation).collect()
    }
}

enum Placement {
    Queued,
    Deferred,
    Dropped,
}

#[derive(Debug)]
struct SchedulerState {
    phase: Phase,
    /// Tasks sent to the channel and not yet picked up.
    pending: usize,
    /// Started tasks that have not finished.
    in_flight: usize,
    /// Started tasks that may still be aborted.
    abortable: AHashMap<u64, MergeAbort>,
    deferred: VecDeque<OneMerge>,
    stats: SchedulerStats,
    close_report: CloseReport,
}

struct SchedulerInner {
    config: SchedulerConfig,
    segments: Arc<SegmentSet>,
    executor: Arc<dyn MergeExecutor>,
    listener: Arc<dyn EngineEventListener>,
    state: Mutex<SchedulerState>,
    changed: Condvar,
    sender: Mutex<Option<Sender<MergeTask>>>,
    cascade: Mutex<Option<MergeFinder>>,
    next_merge_id: AtomicU64,
}

/// Runs merges in the background.
pub struct MergeScheduler {
    inner: Arc<SchedulerInner>,
    receiver: Receiver<MergeTask>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for MergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeScheduler")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl MergeScheduler {
    /// Create a scheduler and start its worker threads.
    pub fn new(
        config: SchedulerConfig,
        segments: Arc<SegmentSet>,
        executor: Arc<dyn MergeExecutor>,
        listener: Arc<dyn EngineEventListener>,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let inner = Arc::new(SchedulerInner {
            config,
            segments,
            executor,
            listener,
            state: Mutex::new(SchedulerState {
                phase: Phase::Open,
                pending: 0,
                in_flight: 0,
                abortable: AHashMap::new(),
                deferred: VecDeque::new(),
                stats: SchedulerStats::default(),
                close_report: CloseReport::default(),
            }),
            changed: Condvar::new(),
            sender: Mutex::new(Some(sender)),
            cascade: Mutex::new(None),
            next_merge_id: AtomicU64::new(1),
        });

        let mut workers = Vec::with_capacity(inner.config.max_thread_count);
        for worker_id in 0..inner.config.max_thread_count {
            let worker_inner = Arc::clone(&inner);
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("merge-worker-{worker_id}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        worker_inner.run(task);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Disconnect the channel so the workers already started exit.
                    inner.sender.lock().take();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(PhalanxError::thread(format!(
                        "failed to spawn merge worker: {e}"
                    )));
                }
            }
        }
        debug!(
            "started merge scheduler with {} workers, max {} merges",
            workers.len(),
            inner.config.max_merge_count
        );

        Ok(MergeScheduler {
            inner,
            receiver,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Install a callback asked for follow-up merges after each published
    /// merge, so that merges can cascade into higher tiers.
    pub fn set_cascade(&self, finder: MergeFinder) {
        *self.inner.cascade.lock() = Some(finder);
    }

    /// Schedule every merge of `spec`. Never blocks on merge I/O.
    pub fn submit(&self, spec: MergeSpecification) -> SubmitOutcome {
        self.inner.submit(spec)
    }

    /// Current statistics.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.running = state.in_flight as u64;
        stats.queued = state.pending as u64;
        stats.deferred = state.deferred.len() as u64;
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase != Phase::Open
    }

    /// Block until no merge is queued or running, or until `timeout`
    /// elapses. Returns whether the scheduler went idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.pending > 0 || state.in_flight > 0 {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.pending == 0 && state.in_flight == 0;
            }
        }
        true
    }

    /// Stop the scheduler.
    ///
    /// Queued and deferred merges are cancelled. With
    /// `await_running_merges`, running merges get up to the grace period to
    /// finish; whatever is still running afterwards (or immediately,
    /// without awaiting) is aborted and never published. Worker threads are
    /// joined before returning. Calling `close` again returns the first
    /// report.
    ///
    /// Must not be called from an event listener.
    pub fn close(&self, reason: &str, await_running_merges: bool) -> CloseReport {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Closed => return state.close_report.clone(),
                Phase::Closing => {
                    while state.phase != Phase::Closed {
                        self.inner.changed.wait(&mut state);
                    }
                    return state.close_report.clone();
                }
                Phase::Open => {}
            }
            info!("closing merge scheduler: {reason}");
            state.phase = Phase::Closing;

            let deferred = state.deferred.len();
            state.deferred.clear();
            state.stats.cancelled += deferred as u64;
            state.close_report.cancelled += deferred;
        }

        // Dropping the sender lets workers exit once the channel is drained.
        self.inner.sender.lock().take();
        while let Ok(task) = self.receiver.try_recv() {
            self.inner.cancel(task);
        }

        if await_running_merges {
            let deadline = Instant::now() + self.inner.config.close_grace_period;
            let mut state = self.inner.state.lock();
            while state.in_flight > 0 {
                if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        {
            let state = self.inner.state.lock();
            if !state.abortable.is_empty() {
                warn!("aborting {} running merges", state.abortable.len());
            }
            for abort in state.abortable.values() {
                abort.abort();
            }
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("merge worker panicked");
            }
        }

        let mut state = self.inner.state.lock();
        state.phase = Phase::Closed;
        self.inner.changed.notify_all();
        let report = state.close_report.clone();
        info!(
            "merge scheduler closed: {} cancelled, {} aborted, {} completed while closing",
            report.cancelled, report.aborted, report.completed_while_closing
        );
        report
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.close("scheduler dropped", false);
    }
}

impl SchedulerInner {
    fn submit(&self, spec: MergeSpecification) -> SubmitOutcome {
        if spec.is_empty() {
            return if self.state.lock().phase == Phase::Open {
                SubmitOutcome::Accepted {
                    queued: 0,
                    deferred: 0,
                    dropped: 0,
                }
            } else {
                SubmitOutcome::Rejected
            };
        }

        let mut state = self.state.lock();
        if state.phase != Phase::Open {
            debug!("rejecting {} merges, scheduler is shutting down", spec.len());
            return SubmitOutcome::Rejected;
        }

        state.stats.submitted += spec.len() as u64;
        let (mut queued, mut deferred, mut dropped) = (0, 0, 0);
        for merge in spec {
            match self.place(&mut state, merge) {
                Placement::Queued => queued += 1,
                Placement::Deferred => deferred += 1,
                Placement::Dropped => dropped += 1,
            }
        }
        SubmitOutcome::Accepted {
            queued,
            deferred,
            dropped,
        }
    }

    /// Reserve and queue one merge, or defer or drop it.
    fn place(&self, state: &mut SchedulerState, merge: OneMerge) -> Placement {
        let generations = merge.generations();
        if state.pending + state.in_flight >= self.config.max_merge_count {
            return self.defer(state, merge);
        }

        match self.segments.try_reserve(&generations) {
            Reservation::Reserved(inputs) => {
                let sender = self.sender.lock().clone();
                let Some(sender) = sender else {
                    self.segments.release(&generations);
                    return self.defer(state, merge);
                };
                let task = MergeTask {
                    id: self.next_merge_id.fetch_add(1, Ordering::Relaxed),
                    inputs,
                    abort: MergeAbort::new(),
                };
                debug!("queued merge {} of segments {generations:?}", task.id);
                if sender.send(task).is_err() {
                    self.segments.release(&generations);
                    return self.defer(state, merge);
                }
                state.pending += 1;
                Placement::Queued
            }
            Reservation::Busy => self.defer(state, merge),
            Reservation::Stale => {
                warn!("dropping merge of segments {generations:?}, an input is no longer live");
                state.stats.dropped += 1;
                Placement::Dropped
            }
        }
    }

    fn defer(&self, state: &mut SchedulerState, merge: OneMerge) -> Placement {
        let generations = merge.generations();
        let duplicate = state
            .deferred
            .iter()
            .any(|queued| queued.generations() == generations);
        if !duplicate {
            state.deferred.push_back(merge);
        }
        Placement::Deferred
    }

    /// Re-validate deferred merges after a merge finished.
    fn retry_deferred(&self, state: &mut SchedulerState) {
        if state.phase != Phase::Open || state.deferred.is_empty() {
            return;
        }
        let deferred: Vec<OneMerge> = state.deferred.drain(..).collect();
        for merge in deferred {
            self.place(state, merge);
        }
    }

    fn cancel(&self, task: MergeTask) {
        self.segments.release(&task.generations());
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        state.stats.cancelled += 1;
        state.close_report.cancelled += 1;
        self.changed.notify_all();
    }

    fn run(&self, task: MergeTask) {
        let generations = task.generations();
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Open {
                drop(state);
                self.cancel(task);
                return;
            }
            state.pending = state.pending.saturating_sub(1);
            state.in_flight += 1;
            state.abortable.insert(task.id, task.abort.clone());
        }

        self.listener.on_event(&EngineEvent::MergeStarted {
            merge_id: task.id,
            segments: generations.clone(),
        });

        let output_generation = self.segments.next_generation();
        let result = self
            .executor
            .merge(&task.inputs, output_generation, &task.abort);

        let completed = match result {
            Ok(output) => self.publish(&task, output),
            Err(e) => {
                self.fail(&task, &e);
                false
            }
        };

        // Follow-up merges are submitted while this one still counts as in
        // flight, so waiters never observe a false idle in between.
        if completed {
            self.cascade();
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.abortable.remove(&task.id);
        if completed && state.phase != Phase::Open {
            state.close_report.completed_while_closing += 1;
        }
        self.retry_deferred(&mut state);
        self.changed.notify_all();
    }

    /// Publish a merge output unless the merge was aborted meanwhile.
    fn publish(&self, task: &MergeTask, output: SegmentDescriptor) -> bool {
        let output_generation = output.generation;
        {
            // Once out of the abortable set, close can no longer abort it.
            let mut state = self.state.lock();
            if task.abort.is_aborted() {
                drop(state);
                if let Err(e) = self.executor.discard(output_generation) {
                    warn!("failed to discard output of aborted merge {}: {e}", task.id);
                }
                self.fail(task, &PhalanxError::aborted("aborted before publication"));
                return false;
            }
            state.abortable.remove(&task.id);
        }

        match self.segments.commit_merge(&task.inputs, output) {
            Ok(outcome) => {
                let input_bytes: u64 = task.inputs.iter().map(|s| s.size_bytes).sum();
                {
                    let mut state = self.state.lock();
                    state.stats.completed += 1;
                    state.stats.bytes_merged += input_bytes;
                }
                info!(
                    "merge {} of {} segments published as generation {} ({} bytes reclaimed)",
                    task.id,
                    task.inputs.len(),
                    outcome.output.generation,
                    outcome.reclaimed_bytes
                );
                self.listener.on_event(&EngineEvent::MergeCompleted {
                    merge_id: task.id,
                    output: outcome.output.clone(),
                    reclaimed_bytes: outcome.reclaimed_bytes,
                });
                self.listener.on_event(&EngineEvent::SegmentSetChanged {
                    total_bytes: outcome.total_bytes,
                    segment_count: outcome.segment_count,
                });
                true
            }
            Err(e) => {
                if let Err(discard) = self.executor.discard(output_generation) {
                    warn!("failed to discard unpublished merge output {output_generation}: {discard}");
                }
                self.fail(task, &e);
                false
            }
        }
    }

    /// Release the inputs of a failed or aborted merge and report it.
    fn fail(&self, task: &MergeTask, e: &PhalanxError) {
        let generations = task.generations();
        self.segments.release(&generations);
        {
            let mut state = self.state.lock();
            if e.is_aborted() {
                state.stats.aborted += 1;
                if state.phase != Phase::Open {
                    state.close_report.aborted += 1;
                }
            } else {
                state.stats.failed += 1;
            }
        }

        if e.is_aborted() {
            warn!("merge {} of segments {generations:?} aborted: {e}", task.id);
        } else {
            error!("merge {} of segments {generations:?} failed: {e}", task.id);
        }
        self.listener.on_event(&EngineEvent::MergeFailed {
            merge_id: task.id,
            segments: generations,
            reason: e.to_string(),
        });
    }

    fn cascade(&self) {
        let finder = self.cascade.lock().clone();
        if let Some(finder) = finder {
            let spec = finder();
            if !spec.is_empty() {
                debug!("cascading {} follow-up merges", spec.len());
                self.submit(spec);
            }
        }
    }
}
