//! Synthetic capture device (`stub://`) for tests and hardware-less runs.
//!
//! URL form: `stub://pattern?fps=30&size=320x240&fail=7`
//! - `fps`: pacing of `grab` (default 30)
//! - `size`: native frame size; defaults to the requested resolution
//! - `fail`: every Nth grab fails, to exercise transient-failure handling
//!
//! Each frame is a single solid value that increases by one per frame, so a
//! frame that mixes two captures is detectable by checking that every byte
//! is equal.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};
use url::Url;

use crate::frame::{Frame, Resolution};

use super::CaptureDevice;

const DEFAULT_FPS: u32 = 30;

pub struct SyntheticDevice {
    label: String,
    native: Resolution,
    fps: u32,
    fail_every: Option<u64>,
    frame_count: u64,
    grab_count: u64,
    last_grab: Option<Instant>,
    open: bool,
}

impl SyntheticDevice {
    pub fn new(native: Resolution, fps: u32) -> Self {
        Self {
            label: "stub://pattern".to_string(),
            native,
            fps,
            fail_every: None,
            frame_count: 0,
            grab_count: 0,
            last_grab: None,
            open: true,
        }
    }

    /// Fail every `n`th grab.
    pub fn with_failures(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn from_url(url: &Url, requested: Resolution) -> Result<Self> {
        let mut device = Self::new(requested, DEFAULT_FPS);
        device.label = url.to_string();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => {
                    device.fps = value
                        .parse()
                        .map_err(|_| anyhow!("stub fps must be an integer, got '{}'", value))?;
                }
                "size" => device.native = value.parse()?,
                "fail" => {
                    let n: u64 = value
                        .parse()
                        .map_err(|_| anyhow!("stub fail must be an integer, got '{}'", value))?;
                    device = device.with_failures(n);
                }
                other => log::debug!("SyntheticDevice: ignoring query parameter {}", other),
            }
        }
        log::info!(
            "SyntheticDevice: connected to {} ({} @ {} fps)",
            device.label,
            device.native,
            device.fps
        );
        Ok(device)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if self.fps == 0 {
            return;
        }
        let interval = Duration::from_millis((1000 / self.fps as u64).max(1));
        if let Some(last) = self.last_grab {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_grab = Some(Instant::now());
    }
}

impl CaptureDevice for SyntheticDevice {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.label)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn grab(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("synthetic device released"));
        }
        self.pace();
        self.grab_count += 1;
        if let Some(n) = self.fail_every {
            if self.grab_count % n == 0 {
                return Err(anyhow!("synthetic grab failure #{}", self.grab_count));
            }
        }
        self.frame_count += 1;
        let value = (self.frame_count % 256) as u8;
        Frame::from_rgb(
            vec![value; self.native.byte_len()],
            self.native.width,
            self.native.height,
        )
    }

    fn release(&mut self) {
        if self.open {
            log::debug!("SyntheticDevice: released {}", self.label);
        }
        self.open = false;
    }
}
