//! The parallel processor.
//!
//! A run has two phases. First every item of the job is announced with a
//! `Queued` event, in source order. Then up to `concurrency` workers are kept
//! busy: whenever one finishes, the next unscheduled item takes its slot,
//! until the source is exhausted or the run is cancelled.
//!
//! ```text
//!  supervisor ──item_at(0..)──▶ Queued, Queued, ...        (announce)
//!      │
//!      ├─ spawn ─▶ worker 0 ─▶ Processing ─▶ Done | Error
//!      ├─ spawn ─▶ worker 1 ─▶ ...                         (fill)
//!      └─ join_next ─▶ spawn next                           (replenish)
//!                                   │
//!                          mpsc ────┴────▶ JobStream
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::JobStatus;
use crate::job::ParallelJob;
use crate::model::RunSummary;
use crate::telemetry::metrics;
use crate::telemetry::run::{record_run_size, start_run_span};

use super::stream::JobStream;
use super::worker::{Emitter, Worker};

/// Default size of the event channel between the runner and the observer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One less than the available hardware parallelism, but never below two.
pub fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(2)
}

/// Tuning knobs for a [`ParallelProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum number of items processed at once. `None` uses
    /// [`default_concurrency`].
    pub concurrency: Option<usize>,
    /// Capacity of the event channel. A slow observer applies backpressure
    /// once this many events are buffered.
    pub channel_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ProcessorConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency),
            ..Self::default()
        }
    }
}

/// Runs a [`ParallelJob`] with bounded concurrency and streams status events.
///
/// A processor runs its job once: [`start`](Self::start) succeeds a single
/// time. [`cancel`](Self::cancel) may be called at any point, any number of
/// times.
pub struct ParallelProcessor<J: ParallelJob> {
    job: Arc<J>,
    concurrency: usize,
    channel_capacity: usize,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl<J: ParallelJob> ParallelProcessor<J> {
    pub fn new(job: J) -> Self {
        Self::with_config(job, ProcessorConfig::default())
    }

    pub fn with_concurrency(job: J, concurrency: usize) -> Self {
        Self::with_config(job, ProcessorConfig::with_concurrency(concurrency))
    }

    pub fn with_config(job: J, config: ProcessorConfig) -> Self {
        Self::from_shared(Arc::new(job), config)
    }

    /// Build a processor around a job the caller keeps a handle to.
    pub fn from_shared(job: Arc<J>, config: ProcessorConfig) -> Self {
        Self {
            job,
            concurrency: config.concurrency.unwrap_or_else(default_concurrency).max(1),
            channel_capacity: config.channel_capacity.max(1),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// Request cooperative cancellation.
    ///
    /// No new items are scheduled afterwards, and in-flight items whose
    /// `process` honors the token end with `JobError::Cancelled`. Returns
    /// immediately; the stream closes once in-flight items have reported.
    /// Cancelling before [`start`](Self::start) makes the run a no-op.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token behind [`cancel`](Self::cancel), for wiring into shutdown
    /// hooks (signal handlers, parent tasks) owned by the embedding
    /// application.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the run and return its event stream.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] if called more than once, or
    /// [`Error::Other`] when called outside a Tokio runtime.
    pub fn start(&self) -> Result<JobStream<J::Item>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("start() needs a Tokio runtime: {e}")))?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let run_id = Uuid::new_v4();
        let span = start_run_span(&run_id, self.concurrency);

        let supervisor = Supervisor {
            job: Arc::clone(&self.job),
            concurrency: self.concurrency,
            emitter: Emitter::new(tx, self.cancel.clone()),
            cancel: self.cancel.clone(),
        };
        let task = runtime.spawn(supervisor.run().instrument(span));

        Ok(JobStream::new(rx, task))
    }
}

/// Owns the scheduling loop of one run.
struct Supervisor<J: ParallelJob> {
    job: Arc<J>,
    concurrency: usize,
    emitter: Emitter<J::Item>,
    cancel: CancellationToken,
}

impl<J: ParallelJob> Supervisor<J> {
    async fn run(self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        if self.cancel.is_cancelled() {
            info!("run cancelled before it started");
            summary.was_cancelled = true;
            summary.duration_ms = started.elapsed().as_millis() as u64;
            metrics::record_run("cancelled");
            return Ok(summary);
        }

        match self.job.can_start().await {
            Ok(true) => {}
            Ok(false) => {
                info!("job declined to start");
                summary.duration_ms = started.elapsed().as_millis() as u64;
                metrics::record_run("refused");
                return Ok(summary);
            }
            Err(e) => {
                error!(error = %e, "job start check failed");
                metrics::record_run("failed");
                return Err(Error::Gate(e));
            }
        }

        summary.queued = self.announce().await;
        record_run_size(&Span::current(), summary.queued);
        info!(
            items = summary.queued,
            concurrency = self.concurrency,
            "all items queued, processing"
        );

        self.schedule(&mut summary).await;

        summary.was_cancelled = self.cancel.is_cancelled();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            queued = summary.queued,
            done = summary.done,
            failed = summary.failed,
            cancelled = summary.cancelled,
            duration_ms = summary.duration_ms,
            "run finished"
        );
        metrics::record_run(if summary.was_cancelled {
            "cancelled"
        } else {
            "completed"
        });
        Ok(summary)
    }

    /// Emit `Queued` for every item in source order. Returns how many were
    /// announced.
    async fn announce(&self) -> usize {
        let mut index = 0;
        while let Some(item) = self.job.item_at(index).await {
            let item = self.job.will_queue(item).await;
            if !self.emitter.emit(JobStatus::Queued { item }).await {
                break;
            }
            index += 1;
            // Let the observer start draining before the walk completes.
            tokio::task::yield_now().await;
        }
        index
    }

    /// Keep up to `concurrency` workers busy until the source runs dry or
    /// the run is cancelled, then wait for the stragglers.
    async fn schedule(&self, summary: &mut RunSummary) {
        let mut workers = JoinSet::new();
        let mut next = 0;
        let mut exhausted = false;

        loop {
            while !exhausted && workers.len() < self.concurrency && !self.cancel.is_cancelled() {
                let Some(item) = self.job.item_at(next).await else {
                    exhausted = true;
                    break;
                };
                let worker = Worker {
                    job: Arc::clone(&self.job),
                    emitter: self.emitter.clone(),
                    cancel: self.cancel.clone(),
                    index: next,
                };
                workers.spawn(worker.run(item).in_current_span());
                next += 1;
            }

            match workers.join_next().await {
                Some(Ok(outcome)) => outcome.tally(summary),
                Some(Err(e)) => error!(error = %e, "worker task crashed"),
                None => break,
            }
        }
    }
}
