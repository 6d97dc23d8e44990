//! heartlink - stream ECG from a sensor, store it locally and upload it.
//!
//! Run with: `cargo run -p heartlink-service -- run`

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use heartlink_core::{Clock, StreamFanout, SystemClock};
use heartlink_service::{Config, Pipeline, TickOutcome, app, default_config_path};
use heartlink_store::{KeyValueStore, Store};

/// Collect ECG from a heartlink sensor and upload it.
#[derive(Parser, Debug)]
#[command(name = "heartlink")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for nearby sensors.
    Scan {
        /// Scan timeout in seconds.
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Connect to a sensor and collect until interrupted.
    Run {
        /// Device identifier or name (overrides config).
        #[arg(long)]
        device: Option<String>,

        /// ECG sampling frequency in Hz (overrides config).
        #[arg(long)]
        frequency: Option<u16>,

        /// Do not upload while running.
        #[arg(long)]
        no_upload: bool,
    },

    /// Upload stored samples once.
    Upload {
        /// Upload even if the last upload is recent.
        #[arg(long)]
        force: bool,
    },

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration (secrets masked).
    Show,
    /// Show the configuration file path.
    Path,
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration file for errors.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args {
        command,
        config,
        database,
        verbose,
    } = Args::parse();

    let default_level = if verbose { "heartlink=debug" } else { "heartlink=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .init();

    let config_path = config.unwrap_or_else(default_config_path);

    match command {
        Command::Config { action } => handle_config_action(&action, &config_path),
        Command::Scan { timeout } => {
            let config = load_config(&config_path, database)?;
            cmd_scan(&config, timeout).await
        }
        Command::Run {
            device,
            frequency,
            no_upload,
        } => {
            let mut config = load_config(&config_path, database)?;
            if device.is_some() {
                config.device.address = device;
            }
            if let Some(frequency) = frequency {
                config.device.ecg_frequency_hz = frequency;
            }
            if no_upload {
                config.upload.enabled = false;
            }
            config.validate()?;
            cmd_run(config).await
        }
        Command::Upload { force } => {
            let config = load_config(&config_path, database)?;
            config.validate()?;
            cmd_upload(config, force).await
        }
    }
}

/// Load the configuration file (defaults if absent) and apply overrides.
fn load_config(path: &Path, database: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        debug!("No config file at {}, using defaults", path.display());
        Config::default()
    };
    if let Some(database) = database {
        config.storage.database = database;
    }
    Ok(config)
}

fn handle_config_action(action: &ConfigAction, path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            let mut config = load_config(path, None)?;
            for secret in [&mut config.auth.client_secret, &mut config.auth.password] {
                if !secret.is_empty() {
                    *secret = "********".to_string();
                }
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
        }
        ConfigAction::Validate => {
            Config::load_validated(path)?;
            println!("{} is valid", path.display());
        }
    }
    Ok(())
}

async fn cmd_scan(config: &Config, timeout: u64) -> anyhow::Result<()> {
    let session = app::open_session(config)
        .await
        .context("Failed to open Bluetooth session")?;

    let mut found = session.scan().await?;
    let mut seen = HashSet::new();
    let _ = tokio::time::timeout(Duration::from_secs(timeout), async {
        while let Some(device) = found.next().await {
            if seen.insert(device.device.id.clone()) {
                let rssi = device
                    .rssi
                    .map(|r| format!("{r} dBm"))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<40} {}", device.device.to_string(), rssi);
            }
        }
    })
    .await;
    session.stop_scan().await?;

    if seen.is_empty() {
        println!("No sensors found");
    }
    Ok(())
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let session = Arc::new(
        app::open_session(&config)
            .await
            .context("Failed to open Bluetooth session")?,
    );
    let found = app::find_device(
        &session,
        config.device.address.as_deref(),
        Duration::from_secs(config.device.scan_timeout_secs),
    )
    .await?;
    let device = found.device;

    let store = Arc::new(Mutex::new(Store::open(&config.storage.database)?));
    let kv = Arc::new(KeyValueStore::open(&config.storage.state_file)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let fanout = StreamFanout::new(config.session.stream_capacity, clock.clone());
    let accumulator = fanout.register_accumulator();
    let chart = fanout.register_chart(config.chart_options())?;
    let _attached = fanout.attach(session.ecg_packets());

    let mut pipeline = Pipeline::new(
        session.clone(),
        accumulator.accumulator().clone(),
        store.clone(),
        kv.clone(),
        (&config.timers).into(),
    );
    if let Some(scheduler) = app::build_scheduler(&config, store, kv, clock)? {
        pipeline = pipeline.with_scheduler(scheduler);
    }
    let projection = pipeline.spawn_status_projection();

    session.connect(&device).await?;
    session
        .subscribe_ecg(&device, config.device.ecg_frequency_hz)
        .await?;
    if config.device.heart_rate {
        session.subscribe_heart_rate(&device).await?;
    }
    let tasks = pipeline.spawn_connection_tasks(&device);
    info!(device = %device, "Collecting, press Ctrl-C to stop");

    let connection = session.connection_token();
    let mut heart_rate = session.heart_rate_stream();
    let mut report = tokio::time::interval(Duration::from_secs(30));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = connection.cancelled() => {
                warn!(device = %device, "Connection lost");
                break;
            }
            Some(reading) = heart_rate.next() => {
                println!("{} bpm", reading.bpm);
            }
            _ = report.tick() => {
                chart.with_buffer(|buffer| {
                    debug!(
                        samples = buffer.samples_written(),
                        redraws = buffer.reset_count(),
                        pending = accumulator.accumulator().len(),
                        dropped_frames = session.dropped_frames(),
                        "Stream status"
                    );
                });
            }
        }
    }

    if session.state().is_connected() {
        if let Err(e) = session.unsubscribe_ecg(&device).await {
            warn!("Failed to stop ECG stream: {}", e);
        }
        if let Err(e) = session.disconnect(&device).await {
            warn!("Failed to disconnect: {}", e);
        }
    }

    tasks.cancel();
    tasks.join().await;
    pipeline.shutdown();
    let _ = projection.await;
    fanout.cancel();
    session.close();
    Ok(())
}

async fn cmd_upload(config: Config, force: bool) -> anyhow::Result<()> {
    let store = Arc::new(Mutex::new(Store::open(&config.storage.database)?));
    let kv = Arc::new(KeyValueStore::open(&config.storage.state_file)?);
    let scheduler =
        app::require_scheduler(app::build_scheduler(&config, store, kv, Arc::new(SystemClock))?)?;

    let outcome = if force {
        scheduler.upload_now().await
    } else {
        scheduler.tick().await
    };

    match outcome {
        TickOutcome::Uploaded { bytes } => println!("Uploaded {bytes} bytes"),
        TickOutcome::Empty => println!("Nothing to upload"),
        TickOutcome::NotDue { remaining } => println!(
            "Next upload due in {}s (use --force to upload now)",
            remaining.as_secs()
        ),
        TickOutcome::Busy => println!("An upload is already running"),
        TickOutcome::Failed { error } => bail!("Upload failed: {error}"),
    }
    Ok(())
}
