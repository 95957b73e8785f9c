//! headcountd - person counting daemon
//!
//! This daemon:
//! 1. Opens the bounded store and starts frame acquisition
//! 2. Loads the configured detector backend (failure disables detection only)
//! 3. Runs detection on the latest frame at the configured rate
//! 4. Logs count changes and periodic camera health until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use headcount::detect::{BackendRegistry, DetectOutcome, DetectionScheduler, StubBackend};
use headcount::feed::{period, CountFeed};
use headcount::{BoundedStore, FrameSource, HeadcountConfig};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Count people seen by a camera")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "HEADCOUNT_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = HeadcountConfig::load_from(args.config.as_deref())?;
    let store = Arc::new(BoundedStore::open(&cfg.db_path, cfg.retention_policy())?);

    let source = Arc::new(FrameSource::new(cfg.camera_config()));
    if let Err(err) = source.start() {
        log::error!("camera {} failed to start: {:#}", cfg.camera.source, err);
        store.log_error(&format!("Failed to start camera: {:#}", err));
    }

    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());
    #[cfg(feature = "backend-tract")]
    {
        if let Some(model_path) = &cfg.detection.model_path {
            let backend = headcount::detect::TractBackend::new(
                model_path.clone(),
                cfg.camera.resolution.width,
                cfg.camera.resolution.height,
            )
            .with_person_class(cfg.detection.person_class_id);
            registry.register(backend);
        }
    }
    let detector = registry.select(&cfg.detection.backend)?;
    log::info!(
        "detector backend {} (available: {})",
        cfg.detection.backend,
        registry.list().join(", ")
    );

    let scheduler = DetectionScheduler::new(Arc::clone(&source), detector, Arc::clone(&store));
    scheduler.set_confidence_threshold(cfg.detection.confidence);
    scheduler.set_detector_enabled(cfg.detection.enabled);
    // Loaded even when disabled so a settings change can switch detection on.
    if let Err(err) = scheduler.load_model() {
        store.log_error(&format!("Failed to load detector model: {:#}", err));
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))?;

    log::info!(
        "headcountd running. writing to {} (ceiling {} MiB)",
        cfg.db_path,
        cfg.store.max_size_mb
    );

    let tick = period(cfg.detection.rate_hz);
    let mut counts = CountFeed::new(Arc::clone(&store));
    let mut last_health_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();

        match scheduler.detect_current() {
            Ok(DetectOutcome::Detected(report)) if !report.stored => {
                log::warn!("count {} was not recorded", report.count);
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("detection failed: {:#}", err);
                store.log_error(&format!("Detection error: {:#}", err));
            }
        }

        match counts.poll() {
            Ok(Some(update)) => log::info!(
                "count={} conf={:.2} at {}",
                update.count,
                update.confidence,
                update.timestamp
            ),
            Ok(None) => {}
            Err(err) => log::warn!("count poll failed: {:#}", err),
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let info = source.info();
            log::info!(
                "camera running={} fps={} frames={} source={} store_bytes={}",
                info.running,
                info.fps,
                info.frames_captured,
                info.source,
                store.size_bytes().unwrap_or(0)
            );
            last_health_log = Instant::now();
        }

        if let Some(remaining) = tick.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    log::info!("shutdown signal received, releasing camera...");
    source.release();
    Ok(())
}
