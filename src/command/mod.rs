//! Command jobs: run an external program once per input line.
//!
//! A command job is described in TOML:
//!
//! ```toml
//! [job]
//! name = "compress"
//! program = "/usr/bin/gzip"
//! args = ["-kf", "{}"]
//! working_dir = "/var/data"   # optional
//! ```
//!
//! Each `{}` in `args` is replaced by the item's input. Items come from a
//! text source, one per non-empty line.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::ParallelJob;
use crate::model::JobError;
use crate::process::{Outputs, ProcessError, run_in};

/// Placeholder replaced by the item input in command arguments.
pub const PLACEHOLDER: &str = "{}";

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct CommandFile {
    job: CommandSpec,
}

/// What to run for each item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Parse a `[job]` table from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CommandFile = toml::from_str(content)?;
        file.job.validate()?;
        Ok(file.job)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read job file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Arguments for one item, with every placeholder substituted.
    ///
    /// If no argument mentions the placeholder, the input is appended as the
    /// last argument.
    pub fn args_for(&self, input: &str) -> Vec<String> {
        if !self.args.iter().any(|a| a.contains(PLACEHOLDER)) {
            let mut args = self.args.clone();
            args.push(input.to_string());
            return args;
        }
        self.args
            .iter()
            .map(|a| a.replace(PLACEHOLDER, input))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("job name must not be empty".to_string()));
        }
        if self.program.as_os_str().is_empty() {
            return Err(Error::Config(format!("job {}: program is empty", self.name)));
        }
        Ok(())
    }

    /// Whether the program looks runnable. Bare names are resolved through
    /// `PATH` at spawn time and are assumed to exist.
    fn program_available(&self) -> bool {
        if self.program.components().count() > 1 {
            self.program.is_file()
        } else {
            true
        }
    }
}

/// One input line and, once processed, what the command printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandItem {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
}

impl CommandItem {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            outputs: None,
        }
    }
}

impl std::fmt::Display for CommandItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.input)
    }
}

/// Read items from a text source, one per non-empty trimmed line.
pub fn read_items(reader: impl BufRead) -> Result<Vec<CommandItem>> {
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            items.push(CommandItem::new(line));
        }
    }
    Ok(items)
}

/// A [`ParallelJob`] running a [`CommandSpec`] for every item.
pub struct CommandJob {
    spec: CommandSpec,
    items: Vec<CommandItem>,
}

impl CommandJob {
    pub fn new(spec: CommandSpec, items: Vec<CommandItem>) -> Self {
        Self { spec, items }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ParallelJob for CommandJob {
    type Item = CommandItem;

    async fn can_start(&self) -> std::result::Result<bool, JobError> {
        if !self.spec.program_available() {
            warn!(
                job = %self.spec.name,
                program = %self.spec.program.display(),
                "program not found, refusing to start"
            );
            return Ok(false);
        }
        if let Some(dir) = &self.spec.working_dir
            && !dir.is_dir()
        {
            return Err(JobError::failed(format!(
                "working directory {} does not exist",
                dir.display()
            )));
        }
        Ok(true)
    }

    async fn item_at(&self, index: usize) -> Option<CommandItem> {
        self.items.get(index).cloned()
    }

    async fn process(
        &self,
        item: CommandItem,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommandItem, JobError> {
        let args = self.spec.args_for(&item.input);
        debug!(job = %self.spec.name, input = %item.input, ?args, "running command");
        let outputs = run_in(
            &self.spec.program,
            &args,
            self.spec.working_dir.as_deref(),
            cancel,
        )
        .await?;
        Ok(CommandItem {
            outputs: Some(outputs),
            ..item
        })
    }

    async fn failed(&self, item: CommandItem, error: &JobError) -> CommandItem {
        if !error.is_cancelled() {
            warn!(job = %self.spec.name, input = %item.input, %error, "command failed");
        }
        match error {
            JobError::Process(ProcessError::AbnormalTermination {
                outputs, ..
            }) => CommandItem {
                outputs: Some(outputs.clone()),
                ..item
            },
            _ => item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_substitute_every_placeholder() {
        let spec = CommandSpec::new("copy", "cp").args(["{}", "{}.bak"]);
        assert_eq!(spec.args_for("a.txt"), vec!["a.txt", "a.txt.bak"]);
    }

    #[test]
    fn args_without_placeholder_append_input() {
        let spec = CommandSpec::new("compress", "gzip").args(["-kf"]);
        assert_eq!(spec.args_for("a.txt"), vec!["-kf", "a.txt"]);
    }

    #[test]
    fn read_items_skips_blank_lines() {
        let items = read_items("one\n\n  two  \n\t\nthree".as_bytes()).unwrap();
        let inputs: Vec<_> = items.iter().map(|i| i.input.as_str()).collect();
        assert_eq!(inputs, vec!["one", "two", "three"]);
    }

    #[test]
    fn bare_program_names_are_assumed_available() {
        assert!(CommandSpec::new("x", "gzip").program_available());
        assert!(!CommandSpec::new("x", "/definitely/not/here").program_available());
    }
}
