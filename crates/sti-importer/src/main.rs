//! STI Importer - SensorThings observation importer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sti_common::logging::{init_logging, LogConfig, LogLevel};
use sti_importer::config::ImporterConfig;
use sti_importer::runner::{build_source, frost_client, remote_fetcher};
use sti_importer::sink::{run_import, ServiceSink};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sti-importer")]
#[command(author, version, about = "Import observations into a SensorThings API service")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configured importer to completion
    Run {
        /// Importer configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Log creates and updates instead of sending them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a configuration file and exit
    Check {
        /// Importer configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<ImporterConfig> {
    ImporterConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sti-importer")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().context("Invalid logging environment")?;

    init_logging(&log_config)?;

    match cli.command {
        Command::Run { config, dry_run } => {
            let mut config = load_config(&config)?;
            config.service.dry_run |= dry_run;

            let service = Arc::new(frost_client(&config.service)?);
            let fetcher = remote_fetcher(&config)?;

            info!(service = %config.service.base_url, "Starting import");
            let mut source = build_source(&config, service.clone(), fetcher).await?;
            let mut sink = ServiceSink::new(service);
            let summary = run_import(&mut source, &mut sink).await?;

            info!(
                "Import complete: {} batches, {} observations created, {} failures",
                summary.batches, summary.created, summary.failures
            );
        },
        Command::Check { config } => {
            let config = load_config(&config)?;
            info!(service = %config.service.base_url, "Configuration is valid");
        },
    }

    Ok(())
}
