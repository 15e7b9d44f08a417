//! driftsync CLI - CDC replication with safe schema evolution.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use driftsync::connectors::{postgres::build_pg_pool, ConnectorRegistry};
use driftsync::metadata::{MetadataStore, PgMetadataStore};
use driftsync::{Config, Runner};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(about = "CDC replication with safe schema evolution")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start syncing
    Run {
        /// Plan and log without writing to the destination
        #[arg(long)]
        dry_run: bool,

        /// Reload every table from a full snapshot before streaming
        #[arg(long)]
        full_resync: bool,
    },

    /// Test source and destination connections
    HealthCheck,

    /// Show aggregate sync statistics
    Stats {
        /// Restrict to one schema
        #[arg(long)]
        schema: Option<String>,

        /// Trailing window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Mark sync runs stuck in 'running' as failed
    Recover {
        /// Age threshold in hours
        #[arg(long, default_value = "24")]
        max_age_hours: i64,
    },

    /// Delete old terminal metadata rows
    Cleanup {
        /// Retention window in days
        #[arg(long)]
        retention_days: Option<i64>,
    },
}

fn init_tracing(format: &str, verbosity: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(verbosity.to_string()));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolve the metadata store for offline commands (stats, recover,
/// cleanup).
fn metadata_store(config: &Config) -> Result<PgMetadataStore, driftsync::SyncError> {
    let pool = build_pg_pool(&config.destination)?;
    Ok(PgMetadataStore::new(
        pool,
        config.destination.metadata_schema.clone(),
    ))
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
    cancel.cancel();
}

async fn run(cli: Cli) -> Result<(), driftsync::SyncError> {
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            dry_run,
            full_resync,
        } => {
            config.dry_run = config.dry_run || dry_run;
            config.full_resync = config.full_resync || full_resync;

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));

            Runner::new(config).run(cancel).await?;
        }
        Commands::HealthCheck => {
            let registry = ConnectorRegistry::with_builtins();
            let source = registry.create_source(&config.source).await?;
            let destination = registry
                .create_destination(&config.destination, Default::default())
                .await?;

            source.connect().await?;
            destination.connect().await?;
            let source_ok = source.test_connection().await;
            let destination_ok = destination.test_connection().await;
            println!(
                "source: {}\ndestination: {}",
                if source_ok { "ok" } else { "FAILED" },
                if destination_ok { "ok" } else { "FAILED" }
            );
            if !source_ok || !destination_ok {
                return Err(driftsync::SyncError::Connection(
                    "health check failed".to_string(),
                ));
            }
        }
        Commands::Stats { schema, hours } => {
            let store = metadata_store(&config)?;
            let report = store.get_sync_statistics(schema.as_deref(), hours).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Recover { max_age_hours } => {
            let store = metadata_store(&config)?;
            let recovered = store
                .recover_failed_runs(chrono::Duration::hours(max_age_hours))
                .await?;
            if recovered.is_empty() {
                println!("no stuck runs");
            } else {
                for id in recovered {
                    println!("recovered {}", id);
                }
            }
        }
        Commands::Cleanup { retention_days } => {
            let store = metadata_store(&config)?;
            let days = retention_days.unwrap_or(config.error_handling.retention_days);
            let report = store.cleanup_old_metadata(days).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_format, &cli.verbosity);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}
