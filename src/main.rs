use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registrar::config::Config;
use registrar::metrics;
use registrar::models::{ClientRegistration, EventType};
use registrar::pipeline::Pipeline;
use registrar::storage::Stores;

#[derive(Parser)]
#[command(
    name = "registrar",
    version,
    about = "SDK heartbeat registration and application announcement pipeline",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, reading newline-delimited JSON heartbeats from stdin
    Run,

    /// List known applications
    Apps,

    /// List stored announcement events
    Events {
        /// Event type filter
        #[arg(short = 't', long, default_value = "application-created")]
        event_type: String,
    },

    /// Print metrics in Prometheus text format
    Metrics,
}

/// One stdin line: a registration payload plus the caller's address
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatLine {
    #[serde(default = "unknown_source")]
    source_address: String,
    #[serde(flatten)]
    registration: ClientRegistration,
}

fn unknown_source() -> String {
    String::from("unknown")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    setup_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Apps => list_apps(&config).await?,
        Commands::Events { event_type } => list_events(&config, &event_type).await?,
        Commands::Metrics => {
            metrics::init_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;
            let text = metrics::encode_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;
            print!("{text}");
        }
    }

    Ok(())
}

fn setup_tracing(config: &Config, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("registrar=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("registrar={},warn", config.logging.level))
            .context("Invalid log level")?
    };

    // stdout carries command output, so logs go to stderr
    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without metrics");
    }

    let stores = Stores::open(&config.storage)
        .await
        .context("Failed to open storage")?;
    let mut pipeline = Pipeline::new(config.pipeline, stores);
    pipeline.start();

    tracing::info!(backend = ?config.storage.backend, "registrar running, reading heartbeats from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut accepted = 0usize;
    let mut rejected = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<HeartbeatLine>(&line) {
                    Ok(hb) => match pipeline.register_heartbeat(&hb.registration, &hb.source_address) {
                        Ok(()) => accepted += 1,
                        Err(e) => {
                            rejected += 1;
                            tracing::warn!(error = %e, "Heartbeat rejected");
                        }
                    },
                    Err(e) => {
                        rejected += 1;
                        tracing::warn!(error = %e, "Malformed heartbeat line");
                    }
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    let final_flush = pipeline.shutdown().await?;
    tracing::info!(accepted, rejected, ?final_flush, "registrar stopped");
    Ok(())
}

async fn list_apps(config: &Config) -> Result<()> {
    let stores = Stores::open(&config.storage)
        .await
        .context("Failed to open storage")?;
    let apps = stores.applications.list().await?;

    if apps.is_empty() {
        println!("No applications registered");
        return Ok(());
    }

    println!("{:<32} {:<10} {:<25} ENVIRONMENT", "APP", "ANNOUNCED", "CREATED");
    for app in apps {
        println!(
            "{:<32} {:<10} {:<25} {}",
            app.app_name,
            app.announced,
            app.created_at.to_rfc3339(),
            app.last_seen_metadata.environment
        );
    }
    Ok(())
}

async fn list_events(config: &Config, event_type: &str) -> Result<()> {
    let filter = EventType::parse(event_type)
        .with_context(|| format!("Unknown event type: {event_type}"))?;

    let stores = Stores::open(&config.storage)
        .await
        .context("Failed to open storage")?;

    for event in stores.events.list(Some(filter)).await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
