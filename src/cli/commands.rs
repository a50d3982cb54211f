//! CLI command definitions for fujifill.
//!
//! Every command reads its settings from the environment first (see
//! [`PipelineConfig::from_env`]); flags given on the command line win.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::export::{NdjsonExporter, RECORDS_PER_FILE};
use crate::metrics::init_metrics;
use crate::pipeline::{BatchDispatcher, PipelineConfig, StopReason};
use crate::scoring::{EndpointPool, HttpFujiApi, ScoringClient};
use crate::storage::{FailurePolicy, PgStore, QueueStore, ReleaseScope};

/// Default output directory for exported scores.
const DEFAULT_EXPORT_DIR: &str = "./fuji-scores";

/// Exit code after a second interrupt.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Batch FUJI scoring for dataset records.
#[derive(Parser)]
#[command(name = "fujifill")]
#[command(about = "Fill FUJI FAIR scores for dataset records from a durable job queue")]
#[command(version)]
#[command(
    long_about = "fujifill scores dataset records against a pool of FUJI endpoints.\n\nWork is coordinated through a PostgreSQL queue table, so any number of\nprocesses can drain the same queue.\n\nExample usage:\n  DATABASE_URL=postgres://localhost/datasets fujifill run\n  fujifill status\n  fujifill export --output ./fuji-scores"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Seed the queue and score records until it is drained.
    Run(RunArgs),

    /// Create the queue table and enqueue unscored records.
    Seed(DatabaseArgs),

    /// Show queue counts by state.
    Status(DatabaseArgs),

    /// Return claimed entries to pending.
    Release(ReleaseArgs),

    /// Return failed entries to pending.
    #[command(name = "requeue-failed")]
    RequeueFailed(DatabaseArgs),

    /// Write scored records to NDJSON files.
    Export(ExportArgs),
}

/// Database connection arguments shared by all commands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct DatabaseArgs {
    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

/// Arguments for `fujifill run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Skip seeding and only drain what is already queued.
    #[arg(long)]
    pub no_seed: bool,

    /// Stop after this many batches.
    #[arg(long)]
    pub max_batches: Option<u64>,

    /// Entries claimed per batch (default: total endpoint capacity).
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// What to do with records that fail for good (skip, mark-failed).
    #[arg(long)]
    pub failure_policy: Option<FailurePolicy>,

    /// Comma-separated FUJI endpoint URLs.
    #[arg(long, value_delimiter = ',')]
    pub endpoints: Vec<String>,

    /// Write Prometheus metrics to this file after every batch.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for `fujifill release`.
#[derive(Parser, Debug)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Only release claims older than the lease timeout.
    #[arg(long)]
    pub stale: bool,
}

/// Arguments for `fujifill export`.
#[derive(Parser, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Output directory for the NDJSON files.
    #[arg(short = 'o', long, default_value = DEFAULT_EXPORT_DIR)]
    pub output: PathBuf,

    /// Records written to each file.
    #[arg(long, default_value_t = RECORDS_PER_FILE)]
    pub per_file: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Seed(args) => run_seed_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Release(args) => run_release_command(args).await,
        Commands::RequeueFailed(args) => run_requeue_failed_command(args).await,
        Commands::Export(args) => run_export_command(args).await,
    }
}

/// Loads the environment, applies `overrides`, then validates.
fn load_config(
    database: &DatabaseArgs,
    overrides: impl FnOnce(PipelineConfig) -> PipelineConfig,
) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load_env()?;
    if let Some(url) = &database.database_url {
        config = config.with_database_url(url.clone());
    }
    let config = overrides(config);
    config.validate()?;
    Ok(config)
}

async fn connect(config: &PipelineConfig) -> anyhow::Result<PgStore> {
    let store = PgStore::connect(&config.database_options())
        .await
        .context("Failed to connect to the database")?;
    Ok(store)
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.database, |mut config| {
        if let Some(max) = args.max_batches {
            config = config.with_max_batches(max);
        }
        if let Some(size) = args.batch_size {
            config = config.with_batch_size(size);
        }
        if let Some(policy) = args.failure_policy {
            config = config.with_failure_policy(policy);
        }
        if !args.endpoints.is_empty() {
            config = config.with_endpoints(crate::scoring::EndpointSource::Explicit(
                args.endpoints.clone(),
            ));
        }
        if let Some(path) = &args.metrics_file {
            config = config.with_metrics_file(path.clone());
        }
        config
    })?;

    init_metrics().context("Failed to initialize metrics")?;

    let api = HttpFujiApi::new(
        config.credentials.clone(),
        config.evaluation.clone(),
        config.request_timeout,
    )?;
    let client = ScoringClient::new(Arc::new(api), config.retry_policy())?;
    let pool = EndpointPool::from_source(&config.endpoints, config.per_endpoint_concurrency)
        .ok_or_else(|| anyhow::anyhow!("No FUJI endpoints configured"))?;

    let store = Arc::new(connect(&config).await?);
    let mut dispatcher = BatchDispatcher::new(store, client, pool, &config);
    dispatcher.prepare(!args.no_seed).await?;

    let stop = spawn_stop_listener();
    let report = dispatcher.run(stop).await?;

    let progress = &report.progress;
    println!("\n=== Scoring Summary ===");
    println!("Stopped:    {}", describe_stop(report.reason));
    println!("Batches:    {}", report.batches);
    println!("Processed:  {}", progress.processed);
    println!("Succeeded:  {}", progress.succeeded);
    println!("Failed:     {}", progress.failed);
    if let Some(remaining) = progress.remaining {
        println!("Remaining:  {}", remaining);
    }
    println!("Elapsed:    {}s", progress.elapsed.as_secs());
    println!("Rate:       {:.2} records/s", progress.overall_rate);
    Ok(())
}

fn describe_stop(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Drained => "queue drained",
        StopReason::StopRequested => "stop requested",
        StopReason::BatchLimit => "batch limit reached",
    }
}

/// First interrupt asks the dispatcher to stop after the current batch;
/// a second one exits immediately and leaves claims to the lease.
fn spawn_stop_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupt received, finishing the current batch");
        if tx.send(true).is_err() {
            return;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt, exiting without waiting for the batch");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
    rx
}

async fn run_seed_command(args: DatabaseArgs) -> anyhow::Result<()> {
    let config = load_config(&args, |config| config)?;
    let store = connect(&config).await?;
    store.ensure_schema().await?;
    let inserted = store.seed().await?;
    println!("Seeded {} queue entries", inserted);
    Ok(())
}

async fn run_status_command(args: DatabaseArgs) -> anyhow::Result<()> {
    let config = load_config(&args, |config| config)?;
    let store = connect(&config).await?;
    store.ensure_schema().await?;
    let counts = store.counts().await?;

    println!("=== Queue Status ===");
    println!("Pending:    {}", counts.pending);
    println!("Claimed:    {}", counts.claimed);
    println!("Failed:     {}", counts.failed);
    println!("Remaining:  {}", counts.remaining());
    println!("Unscored:   {}", counts.unscored);
    Ok(())
}

async fn run_release_command(args: ReleaseArgs) -> anyhow::Result<()> {
    let config = load_config(&args.database, |config| config)?;
    let store = connect(&config).await?;
    store.ensure_schema().await?;

    let scope = if args.stale {
        ReleaseScope::OlderThan(config.lease_timeout)
    } else {
        ReleaseScope::All
    };
    let released = store.release_claims(scope).await?;
    println!("Released {} claimed entries", released);
    Ok(())
}

async fn run_requeue_failed_command(args: DatabaseArgs) -> anyhow::Result<()> {
    let config = load_config(&args, |config| config)?;
    let store = connect(&config).await?;
    store.ensure_schema().await?;
    let requeued = store.requeue_failed().await?;
    println!("Requeued {} failed entries", requeued);
    Ok(())
}

async fn run_export_command(args: ExportArgs) -> anyhow::Result<()> {
    let config = load_config(&args.database, |config| config)?;
    let store = connect(&config).await?;

    let summary = NdjsonExporter::new(&args.output)
        .with_records_per_file(args.per_file)
        .export(&store)
        .await?;

    println!(
        "Exported {} records to {} file(s) in {}",
        summary.records,
        summary.files.len(),
        args.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "fujifill",
            "run",
            "--no-seed",
            "--max-batches",
            "4",
            "--failure-policy",
            "mark-failed",
            "--endpoints",
            "http://a:1071,http://b:1071",
        ])
        .expect("parse");

        match cli.command {
            Commands::Run(args) => {
                assert!(args.no_seed);
                assert_eq!(args.max_batches, Some(4));
                assert_eq!(args.failure_policy, Some(FailurePolicy::MarkFailed));
                assert_eq!(args.endpoints.len(), 2);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_rejects_unknown_policy() {
        let result = Cli::try_parse_from(["fujifill", "run", "--failure-policy", "retry"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_release_and_export() {
        let cli = Cli::try_parse_from(["fujifill", "-l", "debug", "release", "--stale"])
            .expect("parse");
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Release(ReleaseArgs { stale: true, .. })));

        let cli = Cli::try_parse_from(["fujifill", "export"]).expect("parse");
        match cli.command {
            Commands::Export(args) => {
                assert_eq!(args.output, PathBuf::from(DEFAULT_EXPORT_DIR));
                assert_eq!(args.per_file, RECORDS_PER_FILE);
            }
            _ => panic!("expected export"),
        }

        let cli = Cli::try_parse_from(["fujifill", "requeue-failed"]).expect("parse");
        assert!(matches!(cli.command, Commands::RequeueFailed(_)));
    }

    #[test]
    fn test_describe_stop() {
        assert_eq!(describe_stop(StopReason::Drained), "queue drained");
        assert_eq!(describe_stop(StopReason::BatchLimit), "batch limit reached");
    }
}
