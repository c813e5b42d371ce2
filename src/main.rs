// src/main.rs
//! Delivery Tracker - driver console over the delivery engine

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use delivery_tracker::connectivity::ConnectivityMonitor;
use delivery_tracker::delivery::{format_elapsed, StopBuckets};
use delivery_tracker::gps::list_serial_ports;
use delivery_tracker::route::{DirectionsOptimizer, ProximityOptimizer, RouteOptimizer};
use delivery_tracker::storage::{load_json, FileStore, MANIFEST_KEY};
use delivery_tracker::sync::{HttpRemote, RemoteEndpoint, SyncQueue};
use delivery_tracker::tracking::GpsPlatform;
use delivery_tracker::{
    Engine, EngineConfig, EngineEvent, EngineHandle, EngineSnapshot, IncidentReason, Manifest, StopId,
    TrackerConfig,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "delivery-tracker")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the backend base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Override the durable store directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Work through a manifest from an interactive console
    Run {
        /// Manifest to log in with; without it the persisted session resumes
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Show the persisted session and sync queue
    Status,

    /// Send the persisted queue to the backend once
    Flush,

    /// Show or change the configuration
    Config {
        /// Write the configuration file (defaults plus any changes)
        #[arg(long)]
        save: bool,

        /// Backend bearer token
        #[arg(long)]
        token: Option<String>,

        /// Use gpsd at HOST:PORT
        #[arg(long)]
        gpsd: Option<String>,

        /// Use a serial NMEA receiver on this port
        #[arg(long)]
        serial: Option<String>,

        /// Serial baud rate
        #[arg(long, default_value = "9600")]
        baud: u32,
    },

    /// List serial ports that may host a receiver
    Ports,
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<TrackerConfig> {
    let mut config = match &cli.config {
        Some(path) => TrackerConfig::load_from(path),
        None => TrackerConfig::load(),
    }
    .context("failed to load configuration")?;

    if let Some(url) = &cli.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_file.as_ref())?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { manifest } => run(config, manifest).await,
        Commands::Status => status(&config),
        Commands::Flush => flush(&config).await,
        Commands::Config { save, token, gpsd, serial, baud } => {
            configure(config, cli.config.as_ref(), save, token, gpsd, serial, baud)
        }
        Commands::Ports => {
            let ports = list_serial_ports().context("failed to list serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
    }
}

fn open_store(config: &TrackerConfig) -> Result<FileStore> {
    let dir = config.data_dir()?;
    FileStore::new(dir.clone()).with_context(|| format!("failed to open store at {}", dir.display()))
}

async fn run(config: TrackerConfig, manifest: Option<PathBuf>) -> Result<()> {
    let store = Arc::new(open_store(&config)?);
    let remote = Arc::new(HttpRemote::new(&config.api.base_url, config.api.token.clone())?);
    let source = config.gps_source()?;
    info!(source = %source.describe(), "using location source");
    let platform = Box::new(GpsPlatform::new(source));
    let optimizer: Arc<dyn RouteOptimizer> = match &config.route_api_key {
        Some(key) => Arc::new(DirectionsOptimizer::new(key.clone())?),
        None => Arc::new(ProximityOptimizer::default()),
    };

    let (handle, engine_task) = Engine::start(EngineConfig::from(&config), store, remote, platform, optimizer)
        .await
        .context("failed to start engine")?;

    let printer = tokio::spawn(print_events(handle.clone()));

    let monitor = ConnectivityMonitor::for_base_url(
        &config.api.base_url,
        Duration::from_secs(config.connectivity.check_interval_secs.max(1)),
        Duration::from_secs(config.connectivity.check_timeout_secs.max(1)),
    )?;
    let (mut online_rx, check_task) = monitor.spawn();
    let forward_handle = handle.clone();
    let forwarder = tokio::spawn(async move {
        while online_rx.changed().await.is_ok() {
            let online = *online_rx.borrow();
            if forward_handle.set_online(online).await.is_err() {
                break;
            }
        }
    });

    let snapshot = match manifest {
        Some(path) => {
            let manifest = Manifest::load(&path).with_context(|| format!("failed to load {}", path.display()))?;
            handle.login(manifest).await.context("login failed")?
        }
        None => handle.snapshot().await?,
    };
    if snapshot.manifest.is_none() {
        handle.shutdown().await?;
        bail!("no session to resume; pass --manifest");
    }
    print_snapshot(&snapshot);
    println!("Commands: start <id>, complete <id>, incident <id> <reason> [notes], optimize,");
    println!("          flush, status, suspend, resume, logout, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match execute(&handle, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {:#}", e),
        }
    }

    handle.shutdown().await?;
    forwarder.abort();
    check_task.abort();
    printer.abort();
    let _ = engine_task.await;
    Ok(())
}

fn parse_stop(arg: Option<&str>) -> Result<StopId> {
    let arg = arg.context("missing stop id")?;
    arg.parse().with_context(|| format!("invalid stop id {:?}", arg))
}

/// Run one console command. `Ok(false)` ends the session.
async fn execute(handle: &EngineHandle, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };

    match command {
        "start" => handle.start_stop(parse_stop(words.next())?).await?,
        "complete" => handle.complete_stop(parse_stop(words.next())?).await?,
        "incident" => {
            let id = parse_stop(words.next())?;
            let reason: IncidentReason = words.next().context("missing reason")?.parse()?;
            let notes = words.collect::<Vec<_>>().join(" ");
            let notes = (!notes.is_empty()).then_some(notes);
            handle.report_incident(id, reason, notes).await?;
        }
        "optimize" => match handle.optimize_route().await? {
            Some(plan) => println!("Visiting order: {:?}", plan.order),
            None => println!("Keeping manifest order"),
        },
        "flush" => match handle.checkpoint().await {
            Ok(()) => println!("Queue synchronized"),
            Err(e) => println!("Sync deferred: {}", e),
        },
        "status" => print_snapshot(&handle.snapshot().await?),
        "suspend" => handle.suspend().await?,
        "resume" => {
            if let Some(tick) = handle.resume().await? {
                println!("On stop for {}", tick.display);
            }
        }
        "logout" => {
            handle.logout().await?;
            return Ok(false);
        }
        "quit" | "exit" => return Ok(false),
        other => bail!("unknown command {:?}", other),
    }
    Ok(true)
}

async fn print_events(handle: EngineHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::TimerTick(_)) => {}
            Ok(EngineEvent::StopChanged { id, status }) => println!("* stop {} is now {}", id, status),
            Ok(EngineEvent::TrackingModeChanged(mode)) => println!("* tracking: {}", mode),
            Ok(EngineEvent::TrackingUnavailable { reason }) => println!("* tracking unavailable: {}", reason),
            Ok(EngineEvent::TimerStopped) => println!("* timer stopped"),
            Ok(EngineEvent::Arrived { stop }) => println!("* arrived at stop {}", stop),
            Ok(EngineEvent::SyncSucceeded { sent, pending }) => {
                println!("* synced {} entries, {} pending", sent, pending)
            }
            Ok(EngineEvent::SyncFailed { error, pending, .. }) => {
                println!("* sync failed ({}), {} pending", error, pending)
            }
            Ok(EngineEvent::WentOffline) => println!("* offline: changes are saved and sent later"),
            Ok(EngineEvent::BackOnline) => println!("* back online"),
            Ok(EngineEvent::SessionEnded) => println!("* session ended"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event printer lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_snapshot(snapshot: &EngineSnapshot) {
    let Some(manifest) = &snapshot.manifest else {
        println!("No session");
        return;
    };

    println!("Manifest {} ({})", manifest.id, manifest.issued_on);
    match snapshot.active.and_then(|id| manifest.stop(id)) {
        Some(stop) => {
            let elapsed = snapshot.timer.as_ref().map(|t| t.display.clone()).unwrap_or_else(|| format_elapsed(0));
            println!("  active:    #{} {} [{}]", stop.id, stop.client.name, elapsed);
        }
        None => println!("  active:    none"),
    }
    println!("  pending:   {:?}", snapshot.pending);
    println!("  completed: {:?}", snapshot.completed);
    println!("  cancelled: {:?}", snapshot.cancelled);
    println!(
        "  tracking {} | queued {} ({} samples){} | {}",
        snapshot.mode,
        snapshot.queued,
        snapshot.queued_samples,
        if snapshot.flushing { ", flushing" } else { "" },
        if snapshot.online { "online" } else { "offline" }
    );
    if let Some(fix) = &snapshot.last_fix {
        println!("  position:  {} at {}", fix.coordinate, fix.timestamp.format("%H:%M:%S"));
    }
}

fn status(config: &TrackerConfig) -> Result<()> {
    let store = open_store(config)?;
    let queue = SyncQueue::restore(&store, config.sync, chrono::Utc::now())?;

    match load_json::<Manifest>(&store, MANIFEST_KEY)? {
        Some(manifest) => {
            let buckets = StopBuckets::partition(&manifest);
            println!("Manifest {} ({})", manifest.id, manifest.issued_on);
            if let Some(active) = &buckets.active {
                println!("  active:    #{} {}", active.id, active.client.name);
            }
            let pending: Vec<StopId> = manifest.visiting_order().iter().map(|s| s.id).collect();
            println!("  pending:   {:?}", pending);
            println!("  completed: {}", buckets.completed.len());
            println!("  cancelled: {}", buckets.cancelled.len());
        }
        None => println!("No session"),
    }

    println!("Queue: {} entries, {} samples", queue.len(), queue.sample_count());
    for entry in queue.entries() {
        println!(
            "  #{:<5} {} {:<18} {}",
            entry.seq,
            entry.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            entry.mutation.kind(),
            entry.mutation.stop_id().map(|id| format!("stop {}", id)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn flush(config: &TrackerConfig) -> Result<()> {
    let store = open_store(config)?;
    let remote = HttpRemote::new(&config.api.base_url, config.api.token.clone())?;
    let mut queue = SyncQueue::restore(&store, config.sync, chrono::Utc::now())?;

    if queue.is_empty() {
        println!("Nothing to send");
        return Ok(());
    }

    let mut sent = 0;
    while let Some(batch) = queue.begin_flush() {
        let up_to = batch.up_to;
        match remote.send_batch(batch.entries).await {
            Ok(()) => {
                sent += queue.complete_flush(up_to, chrono::Utc::now());
                queue.persist(&store)?;
            }
            Err(e) => {
                queue.abort_flush();
                println!("Sent {} entries, {} still queued", sent, queue.len());
                return Err(e).context("flush failed");
            }
        }
    }

    println!("Sent {} entries to {}", sent, remote.batch_url());
    Ok(())
}

fn configure(
    mut config: TrackerConfig,
    path: Option<&PathBuf>,
    save: bool,
    token: Option<String>,
    gpsd: Option<String>,
    serial: Option<String>,
    baud: u32,
) -> Result<()> {
    if token.is_some() {
        let base_url = config.api.base_url.clone();
        config.update_api(base_url, token);
    }
    if let Some(gpsd) = gpsd {
        let (host, port) = gpsd.rsplit_once(':').unwrap_or((gpsd.as_str(), "2947"));
        let port = port.parse().with_context(|| format!("invalid gpsd port {:?}", port))?;
        config.update_gpsd(host.to_string(), port);
    }
    if let Some(port) = serial {
        config.update_serial(port, baud);
    }

    println!("{}", serde_json::to_string_pretty(&config)?);

    if save {
        let target = match path {
            Some(path) => path.clone(),
            None => TrackerConfig::config_path()?,
        };
        config.save_to(&target)?;
        println!("Saved to {}", target.display());
    }
    Ok(())
}
