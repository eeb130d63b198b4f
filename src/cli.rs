use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use fleet_control::ingress::{self, LineParser, ReplaySummary};
use fleet_control::server::{self, IngressState};
use fleet_control::{ControlSettings, Dispatcher, EventPublisher, FleetConfig};
use fleet_core::ResourceEvent;
use fleet_core::time::iso8601;
use fleet_exec::{ProcessGateway, RecordingGateway};
use fleet_store::{FleetSnapshot, MemoryStore};

use crate::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "fleetctl",
    version,
    about = "Fleet state and overlay network reconciliation for a hypervisor pool"
)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "human")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a log of agent callbacks to a fleet snapshot, recording dispatches
    Replay {
        /// Callback log, one callback line per line
        log: PathBuf,
        /// Fleet snapshot (JSON) to start from; empty fleet when omitted
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Write the resulting fleet snapshot here
        #[arg(long)]
        out: Option<PathBuf>,
        /// Control settings (TOML); defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print every recorded dispatch as a JSON line
        #[arg(long)]
        dispatches: bool,
    },
    /// Accept agent callback lines over TCP and apply them
    Serve {
        /// Fleet config file (TOML)
        #[arg(long)]
        config: PathBuf,
        /// Fleet snapshot (JSON) to start from; empty fleet when omitted
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Validate a fleet config file
    CheckConfig {
        /// Fleet config file (TOML)
        file: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match cli.command {
        Commands::Replay {
            log,
            snapshot,
            out,
            config,
            dispatches,
        } => {
            let config = match config {
                Some(path) => FleetConfig::from_file(&path)?,
                None => FleetConfig::default(),
            };
            run_async(cmd_replay(
                &log,
                snapshot.as_deref(),
                out.as_deref(),
                config.control,
                dispatches,
            ))
        }
        Commands::Serve { config, snapshot } => {
            let config = FleetConfig::from_file(&config)?;
            run_async(cmd_serve(config, snapshot.as_deref()))
        }
        Commands::CheckConfig { file } => cmd_check_config(&file),
    }
}

fn run_async<F, T>(f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}

fn load_store(snapshot: Option<&Path>) -> Result<MemoryStore> {
    let Some(path) = snapshot else {
        return Ok(MemoryStore::new());
    };
    let snapshot = FleetSnapshot::from_file(path)?;
    MemoryStore::from_snapshot(snapshot)
        .with_context(|| format!("Invalid fleet snapshot: {}", path.display()))
}

/// Log every committed resource change until the publisher goes away.
fn drain_events(mut events: mpsc::Receiver<ResourceEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut seen = 0;
        while let Some(event) = events.recv().await {
            seen += 1;
            info!(
                resource = %event.resource_type,
                id = event.resource_id,
                status = %event.status,
                previous = event.previous_status.as_deref().unwrap_or(""),
                at = %iso8601(&event.timestamp),
                "Resource changed"
            );
        }
        seen
    })
}

async fn cmd_replay(
    log: &Path,
    snapshot: Option<&Path>,
    out: Option<&Path>,
    settings: ControlSettings,
    print_dispatches: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(log)
        .with_context(|| format!("Failed to read callback log: {}", log.display()))?;
    let store = Arc::new(load_store(snapshot)?);
    let gateway = Arc::new(RecordingGateway::new());
    let (events, receiver) = EventPublisher::channel(settings.event_queue_size);
    let drain = drain_events(receiver);

    let dispatcher = Dispatcher::new(store.clone(), gateway.clone(), settings, events);
    let parser = LineParser::new()?;
    let summary = ingress::replay(&dispatcher, &parser, &content).await;
    drop(dispatcher);
    let published = drain.await.unwrap_or(0);

    if print_dispatches {
        for dispatch in gateway.dispatches() {
            let line = serde_json::json!({
                "target": dispatch.target,
                "script": dispatch.script(),
                "args": dispatch.args(),
                "payload": dispatch.payload(),
                "delivered": dispatch.delivered,
            });
            println!("{line}");
        }
    }

    if let Some(path) = out {
        store.snapshot().await.write_to(path)?;
        info!(path = %path.display(), "Wrote fleet snapshot");
    }

    let ReplaySummary {
        applied,
        failed,
        skipped,
    } = summary;
    println!(
        "applied={applied} failed={failed} skipped={skipped} dispatches={} events={published}",
        gateway.dispatches().len()
    );
    Ok(())
}

async fn cmd_serve(config: FleetConfig, snapshot: Option<&Path>) -> Result<()> {
    let store = Arc::new(load_store(snapshot)?);
    let gateway = Arc::new(
        ProcessGateway::new(
            config.gateway.program.clone(),
            Duration::from_secs(config.gateway.timeout_secs),
        )
        .with_args(config.gateway.args.clone()),
    );
    let (events, receiver) = EventPublisher::channel(config.control.event_queue_size);
    let drain = drain_events(receiver);

    let state = Arc::new(IngressState {
        dispatcher: Dispatcher::new(store, gateway, config.control.clone(), events),
        parser: LineParser::new()?,
    });
    info!(
        program = %config.gateway.program.display(),
        scripts = %config.control.scripts_dir,
        "Fleet control starting"
    );
    server::serve(state, config.ingress.listen).await?;
    drain.abort();
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = FleetConfig::from_file(path)?;
    println!("config ok: {}", path.display());
    println!("  scripts_dir       {}", config.control.scripts_dir);
    println!("  fdb_group_prefix  {}", config.control.fdb_group_prefix);
    println!("  zone_group_prefix {}", config.control.zone_group_prefix);
    println!("  event_queue_size  {}", config.control.event_queue_size);
    println!("  gateway           {}", config.gateway.program.display());
    println!("  timeout_secs      {}", config.gateway.timeout_secs);
    println!("  listen            {}", config.ingress.listen);
    Ok(())
}
