//! smokewatchd - multi-camera smoke detection daemon
//!
//! This daemon:
//! 1. Loads cameras and detection settings (file + environment)
//! 2. Runs one worker thread per enabled camera
//! 3. Records detections and camera status changes in the event log
//! 4. Reapplies the configuration when the config file changes

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use smokewatch::ingest::default_factory;
use smokewatch::{EventLog, SettingsHandle, SmokewatchConfig, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "SMOKEWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Seconds between config file change checks (0 disables reload).
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,
    /// Seconds between status summaries.
    #[arg(long, default_value_t = 30)]
    status_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = SmokewatchConfig::load_from(args.config.as_deref())?;
    let events = Arc::new(match &config.event_db_path {
        Some(path) => {
            log::info!("event log: {}", path);
            EventLog::sqlite(path)?
        }
        None => {
            log::warn!("no event db configured; events are kept in memory only");
            EventLog::in_memory()
        }
    });

    let settings = SettingsHandle::new(config.detection.clone());
    let mut supervisor = Supervisor::new(settings, Arc::clone(&events), default_factory());
    if let Some(dir) = &config.snapshot_dir {
        log::info!("detection snapshots: {}", dir.display());
        supervisor = supervisor.with_snapshot_dir(dir);
    }
    supervisor.apply_config(&config)?;
    if supervisor.camera_ids().is_empty() {
        log::warn!("no enabled cameras configured");
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .map_err(|e| anyhow!("failed to install signal handler: {}", e))?;
    }

    log::info!(
        "smokewatchd running: {} cameras, sensitivity={}, sliding_window={}, motion_threshold={}",
        supervisor.camera_ids().len(),
        config.detection.sensitivity,
        config.detection.sliding_window,
        config.detection.motion_threshold
    );

    let mut config_mtime = args.config.as_deref().and_then(modified_at);
    let mut last_poll = Instant::now();
    let mut last_status = Instant::now();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));

        if args.poll_secs > 0 && last_poll.elapsed() >= Duration::from_secs(args.poll_secs) {
            last_poll = Instant::now();
            if let Some(path) = args.config.as_deref() {
                let mtime = modified_at(path);
                if mtime.is_some() && mtime != config_mtime {
                    config_mtime = mtime;
                    reload(&mut supervisor, path);
                }
            }
            for id in supervisor.revive_crashed() {
                log::warn!("camera {} restarted after worker exit", id);
            }
        }

        if args.status_secs > 0 && last_status.elapsed() >= Duration::from_secs(args.status_secs)
        {
            last_status = Instant::now();
            for status in supervisor.statuses() {
                log::info!(
                    "camera {} state={:?} fps={:.1} frames={} dropped={} detecting={}",
                    status.id,
                    status.state,
                    status.fps,
                    status.frames_processed,
                    status.frames_dropped,
                    status.detecting
                );
            }
        }
    }

    log::info!("shutdown requested");
    supervisor.stop_all();
    Ok(())
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// A config that fails to load or validate keeps the running setup.
fn reload(supervisor: &mut Supervisor, path: &Path) {
    log::info!("config change detected: {}", path.display());
    let config = match SmokewatchConfig::load_from(Some(path)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("config reload failed, keeping previous settings: {:#}", e);
            return;
        }
    };
    if let Err(e) = supervisor.apply_config(&config) {
        log::error!("config reload rejected, keeping previous settings: {:#}", e);
    }
}
