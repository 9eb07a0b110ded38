//! Per-item status events emitted by the processor.
//!
//! Every item that enters a run is announced with `Queued`, then (if it is
//! scheduled before cancellation) moves through `Processing` to exactly one
//! terminal event: `Done` or `Error`.

use serde::{Deserialize, Serialize};

use crate::model::JobError;

/// The lifecycle status of one item, carrying the item value at that point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus<T> {
    /// Accepted into the pipeline, not yet started.
    Queued { item: T },
    /// Handed to a worker, transform in flight.
    Processing { item: T },
    /// Transform completed; `item` is the transformed result.
    Done { item: T },
    /// Transform failed or was cancelled; `item` is the value reported by
    /// the job's failure hook.
    Error { item: T, cause: JobError },
}

/// Fieldless view of a [`JobStatus`], handy for counting and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Queued,
    Processing,
    Done,
    Error,
}

impl<T> JobStatus<T> {
    pub fn item(&self) -> &T {
        match self {
            JobStatus::Queued { item }
            | JobStatus::Processing { item }
            | JobStatus::Done { item }
            | JobStatus::Error { item, .. } => item,
        }
    }

    pub fn into_item(self) -> T {
        match self {
            JobStatus::Queued { item }
            | JobStatus::Processing { item }
            | JobStatus::Done { item }
            | JobStatus::Error { item, .. } => item,
        }
    }

    pub fn kind(&self) -> StatusKind {
        match self {
            JobStatus::Queued { .. } => StatusKind::Queued,
            JobStatus::Processing { .. } => StatusKind::Processing,
            JobStatus::Done { .. } => StatusKind::Done,
            JobStatus::Error { .. } => StatusKind::Error,
        }
    }

    /// The failure cause, if this is an `Error` event.
    pub fn cause(&self) -> Option<&JobError> {
        match self {
            JobStatus::Error { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

impl StatusKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusKind::Done | StatusKind::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Queued => "queued",
            StatusKind::Processing => "processing",
            StatusKind::Done => "done",
            StatusKind::Error => "error",
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}
