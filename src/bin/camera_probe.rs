//! camera_probe - check that a camera opens and delivers a frame
//!
//! Takes the same camera type codes as the settings page and prints a JSON
//! status line: `{"status":"ok","resolution":"WxH"}` or
//! `{"status":"error","message":...}`. Exits non-zero on error.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use headcount::ingest::SystemDeviceOpener;
use headcount::query::{probe_camera, ProbeReport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a camera and report its frame size")]
struct Args {
    /// Camera type: 0 webcam, 1 board camera, 2 network stream.
    #[arg(long = "type", default_value = "0")]
    camera_type: String,

    /// Stream URL (required for type 2).
    #[arg(long)]
    url: Option<String>,

    /// Requested resolution, WIDTHxHEIGHT.
    #[arg(long, default_value = "640x480")]
    resolution: String,

    /// Seconds to wait for the first frame.
    #[arg(long, default_value_t = 5)]
    wait_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let report = probe_camera(
        Arc::new(SystemDeviceOpener),
        &args.camera_type,
        args.url.as_deref(),
        Some(&args.resolution),
        Duration::from_secs(args.wait_secs),
    );
    println!("{}", serde_json::to_string(&report)?);
    if matches!(report, ProbeReport::Error { .. }) {
        std::process::exit(1);
    }
    Ok(())
}
