//! Execution engine: the bounded-concurrency processor and its event stream.

pub mod processor;
pub mod stream;
mod worker;

pub use processor::{ParallelProcessor, ProcessorConfig, default_concurrency};
pub use stream::JobStream;
