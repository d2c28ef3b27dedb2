//! `arena`: inspect worker payloads and aggregate evaluation jobs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use arena_core::{parse_with_format, ItemStatus, OutputFormat, WorkItem};
use arena_runtime::{connect_queue, Aggregator, ArenaConfig, QueueBackendConfig};

/// Arena Fleet job tooling.
#[derive(Parser, Debug)]
#[command(name = "arena")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a worker payload file and print the execution result
    Parse {
        /// Payload file written by a worker
        file: PathBuf,

        /// Payload format: json or junit
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,

        /// Queue status to assume for the item
        #[arg(short, long, value_enum, default_value = "completed")]
        status: TerminalStatus,
    },

    /// Aggregate a job's terminal items
    Aggregate {
        #[arg(short, long)]
        job: String,

        /// Configuration file (YAML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the flat summary map instead of the full report
        #[arg(long)]
        summary: bool,
    },

    /// Show item counts per state
    Progress {
        #[arg(short, long)]
        job: String,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Return items whose lease has expired to the queue
    Requeue {
        #[arg(short, long)]
        job: String,

        /// How long a worker may hold an item, e.g. "10m"
        #[arg(short, long, value_parser = humantime::parse_duration)]
        lease: Duration,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for ItemStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => ItemStatus::Completed,
            TerminalStatus::Failed => ItemStatus::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Parse { file, format, status } => parse(&file, format, status.into()),
        Commands::Aggregate { job, config, summary } => {
            let config = load_config(config.as_deref())?;
            let queue = connect_queue(&config.queue).await?;
            tracing::debug!(job_id = %job, summary, "Aggregating job");
            let aggregator = Aggregator::new(queue, config.aggregator);

            if summary {
                print_json(&aggregator.job_result(&job).await?)
            } else {
                print_json(&aggregator.aggregate(&job).await?)
            }
        }
        Commands::Progress { job, config } => {
            let config = load_config(config.as_deref())?;
            let queue = connect_queue(&config.queue).await?;
            tracing::debug!(job_id = %job, backend = queue.name(), "Reading job progress");
            print_json(&queue.progress(&job).await?)
        }
        Commands::Requeue { job, lease, config } => {
            let config = load_config(config.as_deref())?;
            let queue = connect_queue(&config.queue).await?;
            let requeued = queue.requeue_stale(&job, lease).await?;
            tracing::info!(job_id = %job, requeued, lease = ?lease, "Stale lease recovery finished");
            println!("{}", requeued);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the configuration for a command that talks to a live job.
///
/// An in-memory queue starts empty in every process, so these commands need
/// a shared backend.
fn load_config(path: Option<&Path>) -> Result<ArenaConfig> {
    let Some(path) = path else {
        bail!("--config is required: jobs live in a shared queue backend such as redis");
    };

    let config = ArenaConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    require_shared_backend(&config)
        .with_context(|| format!("Unusable config {}", path.display()))?;

    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn require_shared_backend(config: &ArenaConfig) -> Result<()> {
    if matches!(config.queue.backend, QueueBackendConfig::Memory) {
        bail!("queue.backend is 'memory', which holds no jobs outside a single process; configure a redis backend");
    }
    Ok(())
}

fn parse(file: &Path, format: OutputFormat, status: ItemStatus) -> Result<()> {
    let payload = std::fs::read(file)
        .with_context(|| format!("Failed to read payload {}", file.display()))?;

    let id = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("payload");
    let mut item = WorkItem::new(id, "", "");
    item.status = status;
    item.result = payload;

    tracing::debug!(file = %file.display(), format = %format, status = %status, "Parsing payload");
    let result = parse_with_format(&item, format)
        .with_context(|| format!("Failed to parse {}", file.display()))?;
    print_json(&result)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_fails_early() {
        let err = load_config(None).unwrap_err();
        assert!(err.to_string().contains("--config is required"));
    }

    #[test]
    fn test_memory_backend_rejected() {
        let config = ArenaConfig::from_yaml("queue:\n  backend:\n    type: memory\n").unwrap();
        assert!(require_shared_backend(&config).is_err());

        let config = ArenaConfig::from_yaml("queue:\n  backend:\n    type: redis\n").unwrap();
        assert!(require_shared_backend(&config).is_ok());
    }

    #[test]
    fn test_cli_parses_requeue_lease() {
        let cli = Cli::try_parse_from(["arena", "requeue", "--job", "j1", "--lease", "10m"]).unwrap();
        match cli.command {
            Commands::Requeue { job, lease, config } => {
                assert_eq!(job, "j1");
                assert_eq!(lease, Duration::from_secs(600));
                assert!(config.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
