//! ab-data - database schema A/B benchmarking
//!
//! Provisions a disposable Postgres sandbox, bridges it to a source database
//! through `postgres_fdw`, applies a migration set and times a list of
//! queries against the result, so two schema designs can be compared under
//! repeatable conditions without touching the source.

mod benchmark;
mod bridge;
mod config;
mod connection;
mod db;
mod error;
mod migration;
mod pipeline;
mod sandbox;
#[cfg(test)]
mod testing;

use crate::benchmark::{load_queries, JsonLinesSink, ResultSink, TextFileSink};
use crate::bridge::CloneSelection;
use crate::config::Settings;
use crate::error::PipelineResult;
use crate::pipeline::{BenchmarkPipeline, ClonePlan, PipelinePlan};
use crate::sandbox::{ContainerProvisioner, Sandbox};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ab-data", version, about = "Benchmark database schema designs for a set of queries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a sandbox, clone, migrate and benchmark
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value = "postgres")]
    platform: Platform,

    /// Comma separated schemas to clone whole
    #[arg(long, default_value = "")]
    schemas: String,

    /// Comma separated schema.table selectors cloned with the schemas
    #[arg(long, default_value = "")]
    tables: String,

    /// Comma separated schema.table selectors for the retry when the first clone fails
    #[arg(long)]
    fallback_tables: Option<String>,

    /// Migration set location (file:// URI or directory)
    #[arg(long, env = "MIGRATIONS_PATH")]
    migrations: Option<String>,

    /// JSON array of benchmark queries
    #[arg(long, env = "BENCHMARK_QUERIES_PATH")]
    queries: PathBuf,

    /// Data migration script with \prompt 'benchmark' checkpoints
    #[arg(long)]
    data_migration: Option<PathBuf>,

    /// Results file, defaults to BENCHMARK_RESULTS_PATH
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Leave the sandbox running after the run
    #[arg(long)]
    keep_sandbox: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Platform {
    Postgres,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Jsonl,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let Platform::Postgres = args.platform;
    info!("📋 Configuration loaded, source {}", settings.source.to_display_string());

    let primary = CloneSelection::new(
        CloneSelection::parse_list(&args.schemas),
        CloneSelection::parse_list(&args.tables),
    )?;
    let mut clone = ClonePlan::new(primary);
    if let Some(tables) = &args.fallback_tables {
        clone = clone.with_fallback(CloneSelection::table_level(CloneSelection::parse_list(tables))?);
    }

    let plan = PipelinePlan {
        target: settings.source.clone(),
        clone,
        migrations: args.migrations,
        queries: load_queries(&args.queries)?,
        data_migration: args.data_migration,
    };

    let output = args.output.unwrap_or_else(|| settings.results_path.clone());
    let mut sink: Box<dyn ResultSink> = match args.format {
        OutputFormat::Text => Box::new(TextFileSink::create(&output)?),
        OutputFormat::Jsonl => Box::new(JsonLinesSink::create(&output)?),
    };
    info!("Writing benchmark results to {}", output.display());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let pipeline = BenchmarkPipeline::new(ContainerProvisioner::new(settings.sandbox), settings.bridge);
    let outcome = match pipeline.run(&plan, sink.as_mut(), &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("❌ Run failed during {} stage: {}", e.stage(), e);
            return Err(e.into());
        }
    };

    info!("✅ {}", serde_json::to_string(&outcome.summary)?);

    finish_sandbox(outcome.sandbox, args.keep_sandbox).await?;
    Ok(())
}

/// Stop the sandbox unless the operator asked to keep it
async fn finish_sandbox<S: Sandbox>(sandbox: S, keep: bool) -> PipelineResult<()> {
    if keep {
        info!("Sandbox left running at {}", sandbox.connection_string());
        return Ok(());
    }
    sandbox.stop().await
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ab_data=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Cancel the run on Ctrl+C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, cancelling run...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, cancelling run...");
        },
    }
    cancel.cancel();
}
