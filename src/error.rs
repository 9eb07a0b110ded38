//! Error types for batchrun.

use thiserror::Error;

use crate::model::JobError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("processor already started; start() may only be called once")]
    AlreadyStarted,

    #[error("job refused to start: {0}")]
    Gate(JobError),

    #[error("supervisor task failed: {0}")]
    Supervisor(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad job definition: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
