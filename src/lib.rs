//! # batchrun
//!
//! Bounded-concurrency job runner.
//!
//! A [`ParallelProcessor`] takes a [`ParallelJob`], announces every item with
//! a `Queued` event, then processes items with at most N in flight, streaming
//! each item's `Processing`, `Done` or `Error` status to the observer through a
//! [`JobStream`]. Cancellation is cooperative: it stops scheduling and lets
//! in-flight items report before the stream closes.

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod model;
pub mod process;
pub mod telemetry;

pub use engine::{JobStream, ParallelProcessor, ProcessorConfig, default_concurrency};
pub use error::{Error, Result};
pub use event::{JobStatus, StatusKind};
pub use job::{ItemsJob, ParallelJob, cancellable};
pub use model::{JobError, RunSummary};
pub use tokio_util::sync::CancellationToken;
