//! One worker: drives a single item from `Processing` to its terminal event.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::event::{JobStatus, StatusKind};
use crate::job::ParallelJob;
use crate::model::{JobError, RunSummary};
use crate::telemetry::metrics;
use crate::telemetry::run::{record_status_transition, start_item_span};

/// Sending half of a run's event channel.
///
/// A closed channel means the observer went away; that is treated as a
/// cancellation request so the run winds down instead of working for nobody.
pub(super) struct Emitter<T> {
    tx: mpsc::Sender<JobStatus<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Emitter<T> {
    pub(super) fn new(tx: mpsc::Sender<JobStatus<T>>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Returns `false` if the observer is gone.
    pub(super) async fn emit(&self, status: JobStatus<T>) -> bool {
        let kind = status.kind();
        if self.tx.send(status).await.is_err() {
            if !self.cancel.is_cancelled() {
                debug!("event stream dropped by observer, cancelling run");
                self.cancel.cancel();
            }
            return false;
        }
        metrics::record_transition(kind);
        true
    }
}

/// How a worker's item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    /// Cancellation arrived before the item was started.
    Skipped,
    Done,
    Failed,
    Cancelled,
}

impl Outcome {
    pub(super) fn tally(self, summary: &mut RunSummary) {
        match self {
            Outcome::Skipped => {}
            Outcome::Done => {
                summary.started += 1;
                summary.done += 1;
            }
            Outcome::Failed => {
                summary.started += 1;
                summary.failed += 1;
            }
            Outcome::Cancelled => {
                summary.started += 1;
                summary.cancelled += 1;
            }
        }
    }
}

pub(super) struct Worker<J: ParallelJob> {
    pub(super) job: Arc<J>,
    pub(super) emitter: Emitter<J::Item>,
    pub(super) cancel: CancellationToken,
    pub(super) index: usize,
}

impl<J: ParallelJob> Worker<J> {
    pub(super) async fn run(self, item: J::Item) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Skipped;
        }

        let span = start_item_span(self.index);
        let item = self.job.will_start(item).await;
        if !self
            .emitter
            .emit(JobStatus::Processing { item: item.clone() })
            .await
        {
            return Outcome::Skipped;
        }
        record_status_transition(
            &span,
            self.index,
            StatusKind::Queued,
            StatusKind::Processing,
        );

        let started = Instant::now();
        let result = AssertUnwindSafe(self.job.process(item.clone(), &self.cancel))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))));
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let finish = |to: StatusKind| {
            metrics::item_duration_ms().record(elapsed_ms, &[KeyValue::new("status", to.as_str())]);
            record_status_transition(&span, self.index, StatusKind::Processing, to);
        };

        match result {
            Ok(done) => {
                finish(StatusKind::Done);
                self.emitter.emit(JobStatus::Done { item: done }).await;
                Outcome::Done
            }
            Err(cause) => {
                let outcome = if cause.is_cancelled() {
                    debug!(index = self.index, "item cancelled mid-flight");
                    Outcome::Cancelled
                } else {
                    warn!(index = self.index, error = %cause, "item failed");
                    Outcome::Failed
                };
                let item = AssertUnwindSafe(self.job.failed(item.clone(), &cause))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        warn!(
                            index = self.index,
                            panic = %panic_message(panic.as_ref()),
                            "failure hook panicked, reporting the unhooked item"
                        );
                        item
                    });
                finish(StatusKind::Error);
                self.emitter.emit(JobStatus::Error { item, cause }).await;
                outcome
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn skipped_items_are_not_counted_as_started() {
        let mut summary = RunSummary::default();
        Outcome::Skipped.tally(&mut summary);
        Outcome::Done.tally(&mut summary);
        Outcome::Cancelled.tally(&mut summary);
        assert_eq!(summary.started, 2);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.cancelled, 1);
    }
}
