//! Command-line interface for fieldscan.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use fieldscan_core::config::{env_vars, DiscoveryConfig};
use fieldscan_core::{DiscoveryEvent, EventBus};
use fieldscan_engine::{read_status_file, Orchestrator};
use fieldscan_storage::StatusFile;

/// fieldscan - industrial device and sensor discovery.
#[derive(Parser, Debug)]
#[command(name = "fieldscan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to $FIELDSCAN_CONFIG, then ./fieldscan.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run discovery cycles on the configured interval until interrupted.
    Run,
    /// Run a single discovery cycle and print its report.
    ScanOnce {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
        /// Also print the generated artifacts of every group.
        #[arg(long)]
        artifacts: bool,
    },
    /// Show the status persisted by the last run.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the default configuration, or validate the selected file.
    Config {
        /// Validate the configuration file instead of printing defaults.
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run => run(args.config).await,
        Command::ScanOnce { json, artifacts } => scan_once(args.config, json, artifacts).await,
        Command::Status { json } => status(args.config, json),
        Command::Config { check } => config(args.config, check),
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Load the selected configuration. A missing default file falls back to
/// built-in defaults; a missing explicit file is an error.
fn load_config(explicit: Option<PathBuf>) -> Result<DiscoveryConfig> {
    let explicit_given = explicit.is_some() || std::env::var(env_vars::CONFIG_PATH).is_ok();
    let path = DiscoveryConfig::resolve_path(explicit);
    if !path.exists() && !explicit_given {
        tracing::warn!(path = %path.display(), "No configuration file, using defaults");
        return Ok(DiscoveryConfig::default());
    }
    DiscoveryConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

/// Forward operator-facing events to the log.
fn spawn_event_logger(bus: &EventBus) {
    let mut alerts = bus.alert_events();
    tokio::spawn(async move {
        while let Some((event, _)) = alerts.recv().await {
            match &event {
                DiscoveryEvent::Fatal { .. } | DiscoveryEvent::Degraded { .. } => {
                    tracing::error!(event = %event.type_name(), detail = ?event, "Discovery alert")
                }
                _ => tracing::warn!(event = %event.type_name(), detail = ?event, "Discovery alert"),
            }
        }
    });
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let bus = Arc::new(EventBus::new());
    spawn_event_logger(&bus);
    let orchestrator = Orchestrator::from_config(config, bus)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current step");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(shutdown_rx).await;
    eprintln!("{}", orchestrator.status());
    Ok(())
}

async fn scan_once(config_path: Option<PathBuf>, json: bool, artifacts: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let bus = Arc::new(EventBus::new());
    spawn_event_logger(&bus);
    let orchestrator = Orchestrator::from_config(config, bus)?;

    let report = orchestrator.run_cycle().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("cycle {} ({} ms)", report.cycle, report.duration_ms);
        for probe in &report.probes {
            match &probe.fault {
                Some(fault) => println!("  {:<20} {} devices  [{}] {}", probe.probe, probe.devices, fault.kind, fault.message),
                None => println!("  {:<20} {} devices", probe.probe, probe.devices),
            }
        }
        let view = orchestrator.registry().get_current_view();
        println!("tags:");
        for tag in &view.tags {
            let confidence = view
                .classification_for(&tag.key())
                .map(|c| c.confidence)
                .unwrap_or_default();
            println!("  {:<40} {} ({:.2})", tag.uns_path, tag.key(), confidence);
        }
        println!();
        print!("{}", orchestrator.status());
    }
    if artifacts {
        println!("{}", serde_json::to_string_pretty(&orchestrator.artifacts())?);
    }
    Ok(())
}

fn status(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let path = config
        .registry
        .snapshot_path
        .context("registry.snapshot_path is not configured; status is only kept with a snapshot store")?;
    // Read the JSON status beside the store; a running engine holds the store locked.
    let file = StatusFile::beside(&path);
    let Some(status) = read_status_file(&file).with_context(|| format!("reading {}", file.path().display()))? else {
        println!("no cycle has completed yet");
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status);
    }
    Ok(())
}

fn config(config_path: Option<PathBuf>, check: bool) -> Result<()> {
    if check {
        let path = DiscoveryConfig::resolve_path(config_path);
        let config = DiscoveryConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
        println!("{}: ok ({} probes)", path.display(), config.probes.len());
    } else {
        print!("{}", DiscoveryConfig::default().to_toml_string()?);
    }
    Ok(())
}
