//! batchrun CLI: run a command once per input line, with bounded concurrency.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use batchrun::command::{CommandItem, CommandJob, CommandSpec, read_items};
use batchrun::config::Config;
use batchrun::telemetry::{TelemetryConfig, init_telemetry};
use batchrun::{JobStatus, ParallelProcessor, RunSummary};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt as _;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "batchrun",
    about = "Run a command once per input line, in parallel"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a job described by a TOML file
    Run {
        /// Path to the job definition
        job: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Run an inline command; `{}` in its arguments is replaced by each input
    Exec {
        #[command(flatten)]
        opts: RunOpts,
        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(clap::Args)]
struct RunOpts {
    /// Read inputs from this file instead of stdin
    #[arg(long, short)]
    input: Option<PathBuf>,
    /// Maximum items processed at once (default: cores - 1, at least 2)
    #[arg(long, short = 'j', value_parser = clap::value_parser!(u32).range(1..))]
    concurrency: Option<u32>,
    /// Print one JSON object per status event
    #[arg(long)]
    json: bool,
    /// Only print terminal events
    #[arg(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "batchrun".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let (spec, opts) = match cli.command {
        Command::Run { job, opts } => (CommandSpec::load(&job)?, opts),
        Command::Exec { opts, command } => (inline_spec(&command)?, opts),
    };
    let items = read_inputs(opts.input.as_deref())?;

    cmd_run(spec, items, &config, &opts).await
}

fn inline_spec(command: &[String]) -> anyhow::Result<CommandSpec> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("exec needs a program to run"))?;
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());
    Ok(CommandSpec::new(name, program).args(args.iter().cloned()))
}

fn read_inputs(path: Option<&Path>) -> anyhow::Result<Vec<CommandItem>> {
    let items = match path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| anyhow::anyhow!("cannot open {}: {e}", path.display()))?;
            read_items(BufReader::new(file))?
        }
        None => read_items(std::io::stdin().lock())?,
    };
    Ok(items)
}

async fn cmd_run(
    spec: CommandSpec,
    items: Vec<CommandItem>,
    config: &Config,
    opts: &RunOpts,
) -> anyhow::Result<ExitCode> {
    let mut processor_config = config.processor_config();
    if let Some(n) = opts.concurrency {
        processor_config.concurrency = Some(n as usize);
    }

    let job = CommandJob::new(spec, items);
    let processor = ParallelProcessor::with_config(job, processor_config);

    // Ctrl-C is the shutdown hook: stop scheduling, let in-flight items report.
    let shutdown = processor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            shutdown.cancel();
        }
    });

    let mut stream = processor.start()?;
    while let Some(status) = stream.next().await {
        print_status(&status, opts)?;
    }
    let summary = stream.finish().await?;

    if summary.queued == 0 && !processor.job().is_empty() {
        eprintln!("job {} refused to start", processor.job().spec().name);
        return Ok(ExitCode::FAILURE);
    }
    print_summary(&summary);

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_status(status: &JobStatus<CommandItem>, opts: &RunOpts) -> anyhow::Result<()> {
    if opts.quiet && !status.is_terminal() {
        return Ok(());
    }

    if opts.json {
        let line = serde_json::json!({
            "at": Utc::now().to_rfc3339(),
            "event": status,
        });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    let item = status.item();
    match status {
        JobStatus::Error { cause, .. } => {
            println!("{:<10}  {}  ({cause})", status.kind(), item.input);
        }
        _ => println!("{:<10}  {}", status.kind(), item.input),
    }
    if let (JobStatus::Done { .. }, Some(outputs)) = (status, &item.outputs)
        && !outputs.standard.is_empty()
    {
        for line in outputs.standard.lines() {
            println!("{:<10}  | {line}", "");
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    eprintln!(
        "\n{} queued, {} done, {} failed, {} cancelled, {} not started ({}ms){}",
        summary.queued,
        summary.done,
        summary.failed,
        summary.cancelled,
        summary.unscheduled(),
        summary.duration_ms,
        if summary.was_cancelled {
            ", run cancelled"
        } else {
            ""
        }
    );
}
