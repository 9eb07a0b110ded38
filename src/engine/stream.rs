//! The observer's end of a run.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::JobStatus;
use crate::model::RunSummary;

/// Ordered stream of status events for one run.
///
/// Yields events in emission order and ends once the source is exhausted (or
/// the run was cancelled) and every in-flight item has reported its terminal
/// event. Dropping the stream early cancels the run.
pub struct JobStream<T> {
    rx: mpsc::Receiver<JobStatus<T>>,
    task: JoinHandle<Result<RunSummary>>,
}

impl<T> JobStream<T> {
    pub(super) fn new(
        rx: mpsc::Receiver<JobStatus<T>>,
        task: JoinHandle<Result<RunSummary>>,
    ) -> Self {
        Self { rx, task }
    }

    /// Next event, or `None` once the run is over.
    pub async fn recv(&mut self) -> Option<JobStatus<T>> {
        self.rx.recv().await
    }

    /// Drain any remaining events and wait for the run to wind down.
    ///
    /// # Errors
    ///
    /// [`Error::Gate`] if the job's start check failed, or
    /// [`Error::Supervisor`] if the scheduling task itself died.
    pub async fn finish(mut self) -> Result<RunSummary> {
        while self.rx.recv().await.is_some() {}
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Supervisor(e.to_string())),
        }
    }
}

impl<T> Stream for JobStream<T> {
    type Item = JobStatus<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
