//! Integration tests for the parallel processor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use batchrun::{
    CancellationToken, Error, ItemsJob, JobError, JobStatus, ParallelJob, ParallelProcessor,
    ProcessorConfig, StatusKind, cancellable,
};
use futures::StreamExt as _;

/// A pull source over a fixed list whose `process` sleeps and honors
/// cancellation.
struct MockJob {
    items: Vec<u32>,
    delay: Duration,
}

impl MockJob {
    fn new(count: u32, delay: Duration) -> Self {
        Self {
            items: (1..=count).collect(),
            delay,
        }
    }
}

#[async_trait]
impl ParallelJob for MockJob {
    type Item = u32;

    async fn item_at(&self, index: usize) -> Option<u32> {
        self.items.get(index).copied()
    }

    async fn process(&self, item: u32, cancel: &CancellationToken) -> Result<u32, JobError> {
        cancellable(cancel, async {
            tokio::time::sleep(self.delay).await;
            Ok(item)
        })
        .await
    }
}

fn count_by_kind<T>(events: &[JobStatus<T>]) -> HashMap<StatusKind, usize> {
    let mut counts = HashMap::new();
    for event in events {
        *counts.entry(event.kind()).or_insert(0) += 1;
    }
    counts
}

/// Walks the event log checking per-item ordering and returns the highest
/// number of items seen in flight at once.
fn check_lifecycle(events: &[JobStatus<u32>]) -> usize {
    let mut queued = HashSet::new();
    let mut in_flight = HashSet::new();
    let mut finished = HashSet::new();
    let mut max_in_flight = 0;

    for event in events {
        let item = *event.item();
        match event.kind() {
            StatusKind::Queued => assert!(queued.insert(item), "item {item} queued twice"),
            StatusKind::Processing => {
                assert!(queued.contains(&item), "item {item} processed before queued");
                assert!(in_flight.insert(item), "item {item} processing twice");
                max_in_flight = max_in_flight.max(in_flight.len());
            }
            StatusKind::Done | StatusKind::Error => {
                assert!(in_flight.remove(&item), "item {item} finished without processing");
                assert!(finished.insert(item), "item {item} finished twice");
            }
        }
    }

    assert!(in_flight.is_empty(), "items left without terminal event: {in_flight:?}");
    max_in_flight
}

// ---------------------------------------------------------------------------
// Normal runs
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_run_reports_every_item_once() {
    let job = MockJob::new(1000, Duration::from_micros(10));
    let processor = ParallelProcessor::with_concurrency(job, 4);

    let events: Vec<_> = processor.start().unwrap().collect().await;

    let mut expected: HashMap<(StatusKind, u32), usize> = HashMap::new();
    for n in 1..=1000 {
        for kind in [StatusKind::Queued, StatusKind::Processing, StatusKind::Done] {
            expected.insert((kind, n), 1);
        }
    }
    let mut actual: HashMap<(StatusKind, u32), usize> = HashMap::new();
    for event in &events {
        *actual.entry((event.kind(), *event.item())).or_insert(0) += 1;
    }
    assert_eq!(actual, expected);

    let max_in_flight = check_lifecycle(&events);
    assert!(max_in_flight <= processor.concurrency());
    assert!(max_in_flight >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_events_come_first_in_source_order() {
    let processor = ParallelProcessor::with_concurrency(MockJob::new(50, Duration::ZERO), 3);

    let events: Vec<_> = processor.start().unwrap().collect().await;

    let queued: Vec<u32> = events
        .iter()
        .take_while(|e| e.kind() == StatusKind::Queued)
        .map(|e| *e.item())
        .collect();
    assert_eq!(queued, (1..=50).collect::<Vec<_>>());
    assert_eq!(events.len(), 150);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finish_reports_run_summary() {
    let processor = ParallelProcessor::with_concurrency(MockJob::new(20, Duration::ZERO), 2);

    let summary = processor.start().unwrap().finish().await.unwrap();

    assert_eq!(summary.queued, 20);
    assert_eq!(summary.started, 20);
    assert_eq!(summary.done, 20);
    assert_eq!(summary.failed, 0);
    assert!(!summary.was_cancelled);
    assert!(summary.is_success());
}

#[tokio::test]
async fn empty_source_closes_without_events() {
    let processor = ParallelProcessor::new(MockJob::new(0, Duration::ZERO));
    let mut stream = processor.start().unwrap();
    assert!(stream.recv().await.is_none());
    let summary = stream.finish().await.unwrap();
    assert_eq!(summary.queued, 0);
}

#[test]
fn default_concurrency_leaves_a_core_free_but_uses_two() {
    let processor = ParallelProcessor::new(MockJob::new(1, Duration::ZERO));
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    assert_eq!(processor.concurrency(), (cores.saturating_sub(1)).max(2));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_after_ten_done_stops_the_run() {
    let job = MockJob::new(1000, Duration::from_millis(5));
    let processor = ParallelProcessor::with_concurrency(job, 4);
    let mut stream = processor.start().unwrap();

    let mut events = Vec::new();
    let mut done = 0;
    while let Some(status) = stream.next().await {
        if status.kind() == StatusKind::Done {
            done += 1;
        }
        events.push(status);
        if done >= 10 {
            processor.cancel();
        }
    }

    let counts = count_by_kind(&events);
    let get = |kind| counts.get(&kind).copied().unwrap_or(0);
    assert_eq!(get(StatusKind::Queued), 1000);
    assert!(get(StatusKind::Done) < 1000);
    assert!(get(StatusKind::Done) >= 10);
    assert!(get(StatusKind::Processing) >= 10);
    assert!(get(StatusKind::Error) >= 1);

    assert!(
        events
            .iter()
            .filter_map(|e| e.cause())
            .all(JobError::is_cancelled)
    );
    check_lifecycle(&events);

    let summary = stream.finish().await.unwrap();
    assert!(summary.was_cancelled);
    assert!(summary.cancelled >= 1);
    assert!(summary.unscheduled() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_cancel_never_duplicates_terminal_events() {
    let job = MockJob::new(200, Duration::from_millis(2));
    let processor = ParallelProcessor::with_concurrency(job, 4);
    let mut stream = processor.start().unwrap();

    let mut events = Vec::new();
    while let Some(status) = stream.next().await {
        if status.is_terminal() {
            processor.cancel();
            processor.cancel();
        }
        events.push(status);
    }
    processor.cancel();

    check_lifecycle(&events);
    assert!(processor.is_cancelled());
}

#[tokio::test]
async fn cancel_before_start_runs_nothing() {
    let processor = ParallelProcessor::new(MockJob::new(10, Duration::ZERO));
    processor.cancel();
    processor.cancel();

    let mut stream = processor.start().unwrap();
    assert!(stream.recv().await.is_none());

    let summary = stream.finish().await.unwrap();
    assert_eq!(summary.queued, 0);
    assert!(summary.was_cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_stream_cancels_the_run() {
    let processor = ParallelProcessor::with_config(
        MockJob::new(500, Duration::from_millis(1)),
        ProcessorConfig {
            concurrency: Some(2),
            channel_capacity: 4,
        },
    );

    let mut stream = processor.start().unwrap();
    assert!(stream.recv().await.is_some());
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !processor.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run was not cancelled after the stream was dropped");
}

// ---------------------------------------------------------------------------
// Misuse and gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_start_is_rejected() {
    let processor = ParallelProcessor::new(MockJob::new(3, Duration::ZERO));
    let stream = processor.start().unwrap();

    assert!(matches!(processor.start(), Err(Error::AlreadyStarted)));

    let summary = stream.finish().await.unwrap();
    assert_eq!(summary.done, 3);
}

#[test]
fn start_outside_runtime_is_an_error() {
    let processor = ParallelProcessor::new(MockJob::new(3, Duration::ZERO));
    assert!(matches!(processor.start(), Err(Error::Other(_))));
}

struct GatedJob {
    gate: Result<bool, JobError>,
    lookups: AtomicUsize,
}

#[async_trait]
impl ParallelJob for GatedJob {
    type Item = u32;

    async fn can_start(&self) -> Result<bool, JobError> {
        self.gate.clone()
    }

    async fn item_at(&self, index: usize) -> Option<u32> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        (index < 5).then_some(index as u32)
    }

    async fn process(&self, item: u32, _cancel: &CancellationToken) -> Result<u32, JobError> {
        Ok(item)
    }
}

#[tokio::test]
async fn closed_gate_produces_no_events() {
    let job = Arc::new(GatedJob {
        gate: Ok(false),
        lookups: AtomicUsize::new(0),
    });
    let processor = ParallelProcessor::from_shared(Arc::clone(&job), ProcessorConfig::default());

    let mut stream = processor.start().unwrap();
    assert!(stream.recv().await.is_none());
    let summary = stream.finish().await.unwrap();

    assert_eq!(summary.queued, 0);
    assert_eq!(job.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_gate_is_reported_by_finish() {
    let processor = ParallelProcessor::new(GatedJob {
        gate: Err(JobError::failed("not ready")),
        lookups: AtomicUsize::new(0),
    });

    let mut stream = processor.start().unwrap();
    assert!(stream.recv().await.is_none());

    match stream.finish().await {
        Err(Error::Gate(JobError::Failed(msg))) => assert_eq!(msg, "not ready"),
        other => panic!("expected gate error, got {other:?}"),
    }
}

/// A gate that takes a while to decide, then declines.
struct SlowGate;

#[async_trait]
impl ParallelJob for SlowGate {
    type Item = u32;

    async fn can_start(&self) -> Result<bool, JobError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(false)
    }

    async fn item_at(&self, index: usize) -> Option<u32> {
        (index < 5).then_some(index as u32)
    }

    async fn process(&self, item: u32, _cancel: &CancellationToken) -> Result<u32, JobError> {
        Ok(item)
    }
}

#[tokio::test]
async fn declined_run_still_reports_its_duration() {
    let processor = ParallelProcessor::new(SlowGate);

    let summary = processor.start().unwrap().finish().await.unwrap();

    assert_eq!(summary.queued, 0);
    assert!(!summary.was_cancelled);
    assert!(summary.duration_ms >= 30, "duration was {}ms", summary.duration_ms);
}

// ---------------------------------------------------------------------------
// Hooks and failures
// ---------------------------------------------------------------------------

/// Every hook leaves a visible mark on the item so tests can tell which
/// value each event carries.
struct HookedJob {
    items: Vec<i64>,
    failed_calls: AtomicUsize,
}

#[async_trait]
impl ParallelJob for HookedJob {
    type Item = i64;

    async fn item_at(&self, index: usize) -> Option<i64> {
        self.items.get(index).copied()
    }

    async fn will_queue(&self, item: i64) -> i64 {
        item * 10
    }

    async fn will_start(&self, item: i64) -> i64 {
        item + 1
    }

    async fn process(&self, item: i64, _cancel: &CancellationToken) -> Result<i64, JobError> {
        if item == 3 {
            return Err(JobError::failed(format!("cannot handle {item}")));
        }
        Ok(item * 2)
    }

    async fn failed(&self, item: i64, _error: &JobError) -> i64 {
        self.failed_calls.fetch_add(1, Ordering::SeqCst);
        -item
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hooks_shape_the_reported_items() {
    let job = Arc::new(HookedJob {
        items: vec![1, 2, 3],
        failed_calls: AtomicUsize::new(0),
    });
    let processor =
        ParallelProcessor::from_shared(Arc::clone(&job), ProcessorConfig::with_concurrency(2));

    let events: Vec<_> = processor.start().unwrap().collect().await;

    let items_of = |kind: StatusKind| {
        let mut items: Vec<i64> = events
            .iter()
            .filter(|e| e.kind() == kind)
            .map(|e| *e.item())
            .collect();
        items.sort();
        items
    };
    assert_eq!(items_of(StatusKind::Queued), vec![10, 20, 30]);
    assert_eq!(items_of(StatusKind::Processing), vec![2, 3, 4]);
    assert_eq!(items_of(StatusKind::Done), vec![4, 8]);
    assert_eq!(items_of(StatusKind::Error), vec![-3]);

    let cause = events.iter().find_map(|e| e.cause()).unwrap();
    assert_eq!(cause, &JobError::Failed("cannot handle 3".to_string()));
    assert_eq!(job.failed_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_do_not_stop_sibling_items() {
    let job = ItemsJob::new((1..=30).collect::<Vec<u32>>(), |n: u32, _cancel| async move {
        if n % 3 == 0 {
            Err(JobError::failed("multiple of three"))
        } else {
            Ok(n)
        }
    });
    let processor = ParallelProcessor::with_concurrency(job, 4);
    let mut stream = processor.start().unwrap();

    let mut events = Vec::new();
    while let Some(status) = stream.recv().await {
        events.push(status);
    }
    check_lifecycle(&events);

    let summary = stream.finish().await.unwrap();
    assert_eq!(summary.done, 20);
    assert_eq!(summary.failed, 10);
    assert_eq!(summary.cancelled, 0);
    assert!(!summary.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_process_still_reports_a_terminal_event() {
    let job = ItemsJob::new(vec![1_u32, 2, 3, 4], |n: u32, _cancel| async move {
        if n == 2 {
            panic!("item two is cursed");
        }
        Ok::<_, JobError>(n)
    });
    let processor = ParallelProcessor::with_concurrency(job, 2);

    let events: Vec<_> = processor.start().unwrap().collect().await;
    check_lifecycle(&events);

    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| e.cause().map(|c| (*e.item(), c.clone())))
        .collect();
    assert_eq!(
        errors,
        vec![(2, JobError::Panicked("item two is cursed".to_string()))]
    );
    assert_eq!(count_by_kind(&events)[&StatusKind::Done], 3);
}

/// Fails item 1 and then panics in its failure hook.
struct PanickingFailureHook;

#[async_trait]
impl ParallelJob for PanickingFailureHook {
    type Item = u32;

    async fn item_at(&self, index: usize) -> Option<u32> {
        (index < 3).then_some(index as u32)
    }

    async fn process(&self, item: u32, _cancel: &CancellationToken) -> Result<u32, JobError> {
        if item == 1 {
            return Err(JobError::failed("odd one out"));
        }
        Ok(item)
    }

    async fn failed(&self, _item: u32, _error: &JobError) -> u32 {
        panic!("failure hook blew up");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_failure_hook_still_reports_the_error() {
    let processor = ParallelProcessor::with_concurrency(PanickingFailureHook, 2);

    let mut stream = processor.start().unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    let summary = stream.finish().await.unwrap();

    check_lifecycle(&events);
    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| e.cause().map(|c| (*e.item(), c.clone())))
        .collect();
    assert_eq!(errors, vec![(1, JobError::failed("odd one out"))]);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 1);
}

// ---------------------------------------------------------------------------
// Sources of unknown length
// ---------------------------------------------------------------------------

/// Generates items on demand and guards its own lookup counter.
struct CountingSource {
    limit: usize,
    lookups: std::sync::Mutex<HashMap<usize, usize>>,
}

#[async_trait]
impl ParallelJob for CountingSource {
    type Item = usize;

    async fn item_at(&self, index: usize) -> Option<usize> {
        *self.lookups.lock().unwrap().entry(index).or_insert(0) += 1;
        (index < self.limit).then_some(index)
    }

    async fn process(&self, item: usize, _cancel: &CancellationToken) -> Result<usize, JobError> {
        tokio::task::yield_now().await;
        Ok(item * item)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lazily_generated_source_runs_to_exhaustion() {
    let job = Arc::new(CountingSource {
        limit: 40,
        lookups: std::sync::Mutex::new(HashMap::new()),
    });
    let processor =
        ParallelProcessor::from_shared(Arc::clone(&job), ProcessorConfig::with_concurrency(3));

    let events: Vec<_> = processor.start().unwrap().collect().await;

    let mut done: Vec<usize> = events
        .iter()
        .filter(|e| e.kind() == StatusKind::Done)
        .map(|e| *e.item())
        .collect();
    done.sort();
    assert_eq!(done, (0..40).map(|n| n * n).collect::<Vec<_>>());

    // Each index is read once to announce it and once to schedule it.
    let lookups = job.lookups.lock().unwrap();
    assert!((0..40).all(|i| lookups[&i] == 2));
}
