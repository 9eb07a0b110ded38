//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Every variable
//! is optional; CLI flags override what is set here.

use crate::engine::ProcessorConfig;
use crate::engine::processor::DEFAULT_CHANNEL_CAPACITY;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// `BATCHRUN_CONCURRENCY`: items processed at once.
    pub concurrency: Option<usize>,
    /// `BATCHRUN_CHANNEL_CAPACITY`: buffered status events.
    pub channel_capacity: usize,
    /// `OTEL_ENDPOINT`: OTLP gRPC endpoint for traces, metrics and logs.
    pub otel_endpoint: Option<String>,
    /// `LOG_LEVEL`: default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            concurrency: positive_var("BATCHRUN_CONCURRENCY")?,
            channel_capacity: positive_var("BATCHRUN_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.channel_capacity),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            concurrency: self.concurrency,
            channel_capacity: self.channel_capacity,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn positive_var(name: &str) -> Result<Option<usize>> {
    let Some(raw) = optional_var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(Error::Config(format!(
            "{name} must be a positive integer, got {raw:?}"
        ))),
    }
}
