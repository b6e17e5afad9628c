//! Spanvault Binary Entry Point
//!
//! Runs the telemetry store with its retention loop, or performs a single
//! maintenance operation and exits. Core functionality lives in the
//! `spanvault` library crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use spanvault::{
    RetentionService, TelemetryStore,
    config::{AppConfig, parse_duration},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Spanvault - Embedded Telemetry Store
#[derive(Parser, Debug)]
#[command(name = "spanvault", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when it does not exist)
    #[arg(
        short,
        long,
        default_value = "configs/spanvault.yaml",
        env = "SPANVAULT_CONFIG"
    )]
    config: PathBuf,

    /// Database path, or `:memory:` (overrides config file)
    #[arg(long, env = "SPANVAULT_DB_PATH")]
    db_path: Option<String>,

    /// Write queue capacity (overrides config file)
    #[arg(long, env = "SPANVAULT_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the store and its retention loop until interrupted (default)
    Run,
    /// Print storage statistics as JSON
    Stats,
    /// Export spans older than a cutoff to Parquet, then delete them
    Archive {
        /// Destination directory
        #[arg(long)]
        dir: PathBuf,
        /// Age cutoff, e.g. `7d` or `12h`
        #[arg(long, value_parser = parse_duration)]
        older_than: Duration,
    },
    /// Delete all spans, logs and sessions
    Clear,
}

fn load_config(cli: &Cli) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = if Path::new(&cli.config).exists() {
        tracing::info!(path = %cli.config.display(), "Loading configuration");
        AppConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    // CLI > ENV > config file
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }
    if let Some(capacity) = cli.queue_capacity {
        config.database.queue_capacity = capacity;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spanvault=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = config.store_builder().build()?;

    let command = cli.command.unwrap_or(Command::Run);
    let result: Result<(), Box<dyn std::error::Error>> = async {
        match command {
            Command::Run => run(&config, store.clone()).await,
            Command::Stats => stats(&store).await,
            Command::Archive { dir, older_than } => {
                let archived = store.archive_to_parquet(&dir, older_than).await?;
                match archived.path {
                    Some(path) => {
                        println!("archived {} spans to {}", archived.rows, path.display())
                    }
                    None => println!(
                        "no spans older than {}",
                        humantime::format_duration(older_than)
                    ),
                }
                Ok(())
            }
            Command::Clear => {
                let cleared = store.clear_all_telemetry().await?;
                println!("{}", serde_json::to_string_pretty(&cleared)?);
                Ok(())
            }
        }
    }
    .await;

    store.shutdown().await;
    if let Some(live) = store.broadcaster() {
        live.dispose();
    }
    result
}

async fn stats(store: &TelemetryStore) -> Result<(), Box<dyn std::error::Error>> {
    let stats = store.storage_stats().await?;
    let genai = store.genai_stats(None, None).await?;
    let size = store.storage_size_bytes().await?;
    let report = serde_json::json!({
        "storage": stats,
        "genai": genai,
        "size_bytes": size,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(config: &AppConfig, store: TelemetryStore) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        database = %config.database.path,
        queue_capacity = config.database.queue_capacity,
        max_concurrent_reads = config.database.max_concurrent_reads,
        retention = config.retention.enabled,
        "Spanvault started"
    );

    let retention = config
        .retention
        .enabled
        .then(|| RetentionService::new(store.clone(), config.retention.to_policy()).spawn());

    tracing::info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    if let Some(handle) = retention {
        tracing::info!("Stopping retention service...");
        handle.shutdown().await;
    }

    let counters = store.counters();
    tracing::info!(
        completed = counters.completed_jobs,
        dropped_jobs = counters.dropped_jobs,
        dropped_records = counters.dropped_records,
        "Shutting down storage..."
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
