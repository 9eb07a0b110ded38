//! Core data model.
//!
//! Per-item failure causes and the summary a finished run reports. The item
//! type itself is chosen by the job; the runner never looks inside it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::ProcessError;

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// Why an item ended in `Error` rather than `Done`.
///
/// Cancellation is kept distinct from transform failures so observers can
/// tell "gave up because asked to" apart from "tried and failed".
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    /// The in-flight item was aborted by a cancellation request.
    #[error("cancelled")]
    Cancelled,

    /// The transform reported a failure.
    #[error("{0}")]
    Failed(String),

    /// A subprocess run on behalf of the item failed.
    #[error(transparent)]
    Process(ProcessError),

    /// The transform panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        JobError::Failed(message.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

impl From<ProcessError> for JobError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled => JobError::Cancelled,
            other => JobError::Process(other),
        }
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Tally of a finished run, returned by `JobStream::finish`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Items announced with a `Queued` event.
    pub queued: usize,
    /// Items that reached `Processing`.
    pub started: usize,
    /// Items that ended in `Done`.
    pub done: usize,
    /// Items that ended in `Error` for a reason other than cancellation.
    pub failed: usize,
    /// Items that ended in `Error` because of cancellation.
    pub cancelled: usize,
    /// Whether cancellation was requested before the run wound down.
    pub was_cancelled: bool,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Items that received a terminal event.
    pub fn finished(&self) -> usize {
        self.done + self.failed + self.cancelled
    }

    /// Queued items that never got a terminal event.
    pub fn unscheduled(&self) -> usize {
        self.queued.saturating_sub(self.finished())
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && !self.was_cancelled
    }
}
