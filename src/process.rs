//! Subprocess helper for job implementations.
//!
//! Runs an executable, captures its output as trimmed text, and kills the
//! child if the caller's cancellation token fires first.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured standard output and standard error of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    pub standard: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ProcessError {
    #[error("process exited abnormally with code {code}")]
    AbnormalTermination { code: i32, outputs: Outputs },

    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("process cancelled")]
    Cancelled,
}

/// Run `program` with `args`, returning its outputs.
///
/// A non-zero exit status is an error carrying the exit code (`-1` when the
/// process was killed by a signal) and whatever the process printed. If
/// `cancel` fires before the process exits, the child is killed.
pub async fn run_async<I, S>(
    program: impl AsRef<Path>,
    args: I,
    cancel: &CancellationToken,
) -> Result<Outputs, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_in(program, args, None, cancel).await
}

/// Like [`run_async`], with an explicit working directory for the child.
pub async fn run_in<I, S>(
    program: impl AsRef<Path>,
    args: I,
    working_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<Outputs, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let spawn_error = |e: std::io::Error| ProcessError::Spawn {
        program: program.display().to_string(),
        message: e.to_string(),
    };

    let child = command.spawn().map_err(spawn_error)?;
    debug!(program = %program.display(), pid = child.id(), "process spawned");

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(program = %program.display(), "process cancelled, killing child");
            return Err(ProcessError::Cancelled);
        }
        output = child.wait_with_output() => output.map_err(spawn_error)?,
    };

    let outputs = Outputs {
        standard: trimmed(&output.stdout),
        error: trimmed(&output.stderr),
    };

    if output.status.success() {
        Ok(outputs)
    } else {
        Err(ProcessError::AbnormalTermination {
            code: output.status.code().unwrap_or(-1),
            outputs,
        })
    }
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
