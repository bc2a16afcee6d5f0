//! Tests for the background merge scheduler.

use ahash::AHashSet;
use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use phalanx::error::Result;
use phalanx::event::{ChannelEventListener, EngineEvent, NoopEventListener};
use phalanx::merge::{
    MergeAbort, MergeExecutor, MergeScheduler, MergeSpecification, OneMerge, SchedulerConfig,
    StorageMergeExecutor,
};
use phalanx::segment::{SegmentDescriptor, SegmentSet};
use phalanx::storage::{
    MemoryStorage, Storage, StorageInput, StorageOutput, segment_file_name,
};
use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Executor whose merges block until released and can be told to fail.
#[derive(Debug)]
struct GatedExecutor {
    started: Sender<Vec<u64>>,
    release: Receiver<()>,
    failing: Mutex<AHashSet<u64>>,
}

impl GatedExecutor {
    fn new() -> (Arc<Self>, Receiver<Vec<u64>>, Sender<()>) {
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let executor = Arc::new(GatedExecutor {
            started: started_tx,
            release: release_rx,
            failing: Mutex::new(AHashSet::new()),
        });
        (executor, started_rx, release_tx)
    }

    fn fail_on(&self, generation: u64) {
        self.failing.lock().insert(generation);
    }
}

impl MergeExecutor for GatedExecutor {
    fn merge(
        &self,
        inputs: &[SegmentDescriptor],
        output_generation: u64,
        abort: &MergeAbort,
    ) -> Result<SegmentDescriptor> {
        let generations: Vec<u64> = inputs.iter().map(|s| s.generation).collect();
        let _ = self.started.send(generations.clone());

        loop {
            abort.check("gated merge aborted")?;
            match self.release.recv_timeout(Duration::from_millis(5)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }

        let failing = self.failing.lock();
        if generations.iter().any(|g| failing.contains(g)) {
            return Err(anyhow!("simulated I/O error merging {generations:?}").into());
        }

        let size = inputs.iter().map(|s| s.live_bytes()).sum();
        let docs = inputs.iter().map(|s| s.live_docs).sum();
        Ok(SegmentDescriptor::new(output_generation, size, docs))
    }

    fn discard(&self, _output_generation: u64) -> Result<()> {
        Ok(())
    }

    fn delete_segments(&self, _generations: &[u64]) -> Result<()> {
        Ok(())
    }
}

/// Memory storage whose reads of one file fail part of the way through.
#[derive(Debug)]
struct FaultyStorage {
    inner: MemoryStorage,
    broken: String,
    fail_after: usize,
}

#[derive(Debug)]
struct FailingInput {
    inner: Box<dyn StorageInput>,
    remaining: usize,
}

impl Read for FailingInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::other("simulated disk failure"));
        }
        let want = buf.len().min(self.remaining);
        let read = self.inner.read(&mut buf[..want])?;
        self.remaining -= read;
        Ok(read)
    }
}

impl StorageInput for FailingInput {
    fn size(&self) -> Result<u64> {
        self.inner.size()
    }
}

impl Storage for FaultyStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let input = self.inner.open_input(name)?;
        if name == self.broken {
            Ok(Box::new(FailingInput {
                inner: input,
                remaining: self.fail_after,
            }))
        } else {
            Ok(input)
        }
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.inner.create_output(name)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)
    }
}

fn segment_set(count: u64) -> Arc<SegmentSet> {
    Arc::new(
        SegmentSet::with_segments(
            (1..=count)
                .map(|g| SegmentDescriptor::new(g, 100, 10))
                .collect(),
        )
        .unwrap(),
    )
}

fn config(threads: usize, grace: Duration) -> SchedulerConfig {
    SchedulerConfig {
        max_thread_count: threads,
        max_merge_count: threads + 2,
        close_grace_period: grace,
    }
}

fn spec(set: &SegmentSet, generations: &[u64]) -> MergeSpecification {
    let segments = generations.iter().filter_map(|g| set.get(*g)).collect();
    let mut spec = MergeSpecification::new();
    spec.add(OneMerge::new(segments, set.total_bytes(), 0.1));
    spec
}

fn started(receiver: &Receiver<Vec<u64>>) -> Vec<u64> {
    receiver.recv_timeout(WAIT).unwrap()
}

#[test]
fn test_disjoint_merges_run_in_parallel_and_overlap_is_deferred() {
    let set = segment_set(6);
    let (executor, started_rx, release) = GatedExecutor::new();
    let (listener, _events) = ChannelEventListener::new();
    let scheduler = MergeScheduler::new(
        config(2, WAIT),
        Arc::clone(&set),
        executor,
        Arc::new(listener),
    )
    .unwrap();

    assert_eq!(scheduler.submit(spec(&set, &[1, 2])).queued(), 1);
    assert_eq!(scheduler.submit(spec(&set, &[3, 4])).queued(), 1);

    // Both merges are blocked inside the executor at the same time.
    let mut running = vec![started(&started_rx), started(&started_rx)];
    running.sort();
    assert_eq!(running, vec![vec![1, 2], vec![3, 4]]);
    assert_eq!(scheduler.stats().running, 2);

    let outcome = scheduler.submit(spec(&set, &[2, 5]));
    assert_eq!(outcome.deferred(), 1);
    assert!(!set.is_merging(5));

    // The same merge is only remembered once.
    assert_eq!(scheduler.submit(spec(&set, &[2, 5])).deferred(), 1);
    assert_eq!(scheduler.stats().deferred, 1);

    release.send(()).unwrap();
    release.send(()).unwrap();
    assert!(scheduler.wait_for_idle(WAIT));

    // Segment 2 was retired by the first merge, so the deferred merge is
    // dropped on re-validation.
    let stats = scheduler.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.deferred, 0);
    assert_eq!(set.len(), 4);
    assert!(set.contains(5) && set.contains(6));
    assert!(!set.is_merging(5));
}

#[test]
fn test_merge_count_cap_defers_without_reserving() {
    let set = segment_set(4);
    let (executor, started_rx, release) = GatedExecutor::new();
    let scheduler = MergeScheduler::new(
        SchedulerConfig {
            max_thread_count: 2,
            max_merge_count: 1,
            close_grace_period: WAIT,
        },
        Arc::clone(&set),
        executor,
        Arc::new(NoopEventListener),
    )
    .unwrap();

    assert_eq!(scheduler.submit(spec(&set, &[1, 2])).queued(), 1);
    assert_eq!(started(&started_rx), vec![1, 2]);

    // A worker is idle, but the cap keeps the second merge waiting and
    // its inputs stay free.
    let outcome = scheduler.submit(spec(&set, &[3, 4]));
    assert_eq!(outcome.queued(), 0);
    assert_eq!(outcome.deferred(), 1);
    assert!(!set.is_merging(3) && !set.is_merging(4));
    assert_eq!(scheduler.stats().deferred, 1);
    assert!(started_rx.recv_timeout(Duration::from_millis(50)).is_err());

    release.send(()).unwrap();
    assert_eq!(started(&started_rx), vec![3, 4]);
    assert!(set.is_merging(3));
    release.send(()).unwrap();
    assert!(scheduler.wait_for_idle(WAIT));

    let stats = scheduler.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.deferred, 0);
    assert_eq!(set.len(), 2);
}

#[test]
fn test_deferred_merge_runs_after_failed_merge_frees_inputs() {
    let set = segment_set(4);
    let (executor, started_rx, release) = GatedExecutor::new();
    executor.fail_on(1);
    let (listener, events) = ChannelEventListener::new();
    let scheduler = MergeScheduler::new(
        config(2, WAIT),
        Arc::clone(&set),
        executor,
        Arc::new(listener),
    )
    .unwrap();

    scheduler.submit(spec(&set, &[1, 2]));
    assert_eq!(started(&started_rx), vec![1, 2]);
    assert_eq!(scheduler.submit(spec(&set, &[2, 3])).deferred(), 1);

    release.send(()).unwrap();
    assert_eq!(started(&started_rx), vec![2, 3]);
    release.send(()).unwrap();
    assert!(scheduler.wait_for_idle(WAIT));

    let stats = scheduler.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert!(set.contains(1));
    assert!(!set.contains(2) && !set.contains(3));
    assert_eq!(set.len(), 3);

    let failed: Vec<EngineEvent> = events
        .try_iter()
        .filter(|e| matches!(e, EngineEvent::MergeFailed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    match &failed[0] {
        EngineEvent::MergeFailed {
            segments, reason, ..
        } => {
            assert_eq!(segments, &vec![1, 2]);
            assert!(reason.contains("simulated I/O error"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_failed_merge_leaves_inputs_live_and_no_output() {
    let inner = MemoryStorage::new();
    for generation in 1..=3 {
        inner.put_file(&segment_file_name(generation), vec![generation as u8; 1000]);
    }
    let storage = Arc::new(FaultyStorage {
        inner,
        broken: segment_file_name(2),
        fail_after: 100,
    });
    let set = Arc::new(
        SegmentSet::with_segments(
            (1..=3)
                .map(|g| SegmentDescriptor::new(g, 1000, 10))
                .collect(),
        )
        .unwrap(),
    );
    let executor = StorageMergeExecutor::new(storage.clone()).with_chunk_size(64);
    let scheduler = MergeScheduler::new(
        config(1, WAIT),
        Arc::clone(&set),
        Arc::new(executor),
        Arc::new(ChannelEventListener::new().0),
    )
    .unwrap();

    assert_eq!(scheduler.submit(spec(&set, &[1, 2, 3])).queued(), 1);
    assert!(scheduler.wait_for_idle(WAIT));

    assert_eq!(scheduler.stats().failed, 1);
    assert_eq!(set.len(), 3);
    for generation in 1..=3 {
        assert!(set.contains(generation));
        assert!(!set.is_merging(generation));
    }
    assert_eq!(
        storage.list_files().unwrap(),
        vec!["seg_1.dat", "seg_2.dat", "seg_3.dat"]
    );

    let snapshot = set.snapshot();
    assert_eq!(snapshot.generations(), vec![1, 2, 3]);
    drop(snapshot);

    // The failed inputs can be selected again.
    assert_eq!(scheduler.submit(spec(&set, &[1, 2, 3])).queued(), 1);
    assert!(scheduler.wait_for_idle(WAIT));
    assert_eq!(scheduler.stats().failed, 2);
}

#[test]
fn test_successful_merge_events() {
    let set = segment_set(3);
    let (executor, _started, release) = GatedExecutor::new();
    drop(release);
    let (listener, events) = ChannelEventListener::new();
    let scheduler = MergeScheduler::new(
        config(1, WAIT),
        Arc::clone(&set),
        executor,
        Arc::new(listener),
    )
    .unwrap();

    scheduler.submit(spec(&set, &[1, 2]));
    assert!(scheduler.wait_for_idle(WAIT));

    let kinds: Vec<&'static str> = events.try_iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec!["merge_started", "merge_completed", "segment_set_changed"]
    );
    assert_eq!(set.len(), 2);
    assert_eq!(scheduler.stats().bytes_merged, 200);
}

#[test]
fn test_close_cancels_queued_and_aborts_running() {
    let set = segment_set(6);
    let (executor, started_rx, _release) = GatedExecutor::new();
    let scheduler = MergeScheduler::new(
        config(1, Duration::from_millis(50)),
        Arc::clone(&set),
        executor,
        Arc::new(ChannelEventListener::new().0),
    )
    .unwrap();

    scheduler.submit(spec(&set, &[1, 2]));
    assert_eq!(started(&started_rx), vec![1, 2]);
    assert_eq!(scheduler.submit(spec(&set, &[3, 4])).queued(), 1);
    assert_eq!(scheduler.submit(spec(&set, &[2, 5])).deferred(), 1);

    let report = scheduler.close("shutting down", true);
    assert_eq!(report.cancelled, 2);
    assert_eq!(report.aborted, 1);
    assert_eq!(report.completed_while_closing, 0);

    assert_eq!(set.len(), 6);
    for generation in 1..=6 {
        assert!(!set.is_merging(generation));
    }
    assert!(scheduler.submit(spec(&set, &[5, 6])).is_rejected());
    assert_eq!(scheduler.close("again", false), report);
}

#[test]
fn test_close_waits_for_running_merges() {
    let set = segment_set(4);
    let (executor, started_rx, release) = GatedExecutor::new();
    let scheduler = MergeScheduler::new(
        config(1, WAIT),
        Arc::clone(&set),
        executor,
        Arc::new(ChannelEventListener::new().0),
    )
    .unwrap();

    scheduler.submit(spec(&set, &[1, 2]));
    assert_eq!(started(&started_rx), vec![1, 2]);

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();
    });
    let report = scheduler.close("shutting down", true);
    releaser.join().unwrap();

    assert_eq!(report.completed_while_closing, 1);
    assert_eq!(report.aborted, 0);
    assert_eq!(set.len(), 3);
}

#[test]
fn test_cascade_merges_follow_ups() {
    let set = segment_set(4);
    let (executor, _started, release) = GatedExecutor::new();
    drop(release);
    let scheduler = MergeScheduler::new(
        config(2, WAIT),
        Arc::clone(&set),
        executor,
        Arc::new(ChannelEventListener::new().0),
    )
    .unwrap();

    let cascade_set = Arc::clone(&set);
    scheduler.set_cascade(Arc::new(move || {
        let (segments, merging) = cascade_set.merge_view();
        let idle: Vec<SegmentDescriptor> = segments
            .into_iter()
            .filter(|s| !merging.contains(&s.generation))
            .collect();
        let mut spec = MergeSpecification::new();
        if idle.len() >= 2 {
            spec.add(OneMerge::new(idle, cascade_set.total_bytes(), 0.1));
        }
        spec
    }));

    scheduler.submit(spec(&set, &[1, 2]));
    assert!(scheduler.wait_for_idle(WAIT));

    assert_eq!(set.len(), 1);
    assert_eq!(set.total_bytes(), 400);
    assert_eq!(scheduler.stats().completed, 2);
}

#[test]
fn test_executor_error_is_contained() {
    let set = segment_set(2);
    let (executor, _started, release) = GatedExecutor::new();
    executor.fail_on(2);
    drop(release);
    let scheduler = MergeScheduler::new(
        config(1, WAIT),
        Arc::clone(&set),
        executor,
        Arc::new(ChannelEventListener::new().0),
    )
    .unwrap();

    let outcome = scheduler.submit(spec(&set, &[1, 2]));
    assert_eq!(outcome.queued(), 1);
    assert!(scheduler.wait_for_idle(WAIT));
    assert_eq!(scheduler.stats().failed, 1);
    assert_eq!(scheduler.stats().aborted, 0);
    assert_eq!(set.len(), 2);
    assert_eq!(scheduler.close("done", true).aborted, 0);
}
