//! Streaming suppliers: a paced MJPEG part feed and a change-only count feed.
//!
//! Both are pull-based. A consumer stops by no longer polling.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::camera::FrameSource;
use crate::clock::{Clock, SystemClock};
use crate::storage::BoundedStore;

/// Upper bound for raw frame streaming, in Hz.
pub const STREAM_MAX_FPS: f32 = 10.0;
/// Upper bound for on-demand detection polling, in Hz.
pub const DETECT_MAX_HZ: f32 = 5.0;
/// Count-change poll rate, in Hz.
pub const COUNT_POLL_HZ: f32 = 2.0;

pub const MJPEG_BOUNDARY: &str = "frame";
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Period for a rate in Hz.
pub fn period(hz: f32) -> Duration {
    Duration::from_secs_f32(1.0 / hz.max(f32::EPSILON))
}

/// One part of a `multipart/x-mixed-replace` MJPEG body.
pub fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Endless MJPEG part supplier paced at no more than `STREAM_MAX_FPS`.
pub struct MjpegFeed {
    source: Arc<FrameSource>,
    quality: u8,
    period: Duration,
    last: Option<Instant>,
}

impl MjpegFeed {
    pub fn new(source: Arc<FrameSource>, quality: u8) -> Self {
        Self {
            source,
            quality,
            period: period(STREAM_MAX_FPS),
            last: None,
        }
    }
}

impl Iterator for MjpegFeed {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.period {
                thread::sleep(self.period - elapsed);
            }
        }
        self.last = Some(Instant::now());
        Some(mjpeg_part(&self.source.get_frame_encoded(self.quality)))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CountUpdate {
    pub count: u32,
    pub timestamp: i64,
    pub confidence: f32,
}

impl CountUpdate {
    /// Server-sent event carrying this update as JSON.
    pub fn to_sse(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Emits the latest stored count only when it differs from the last emission.
pub struct CountFeed {
    store: Arc<BoundedStore>,
    clock: Arc<dyn Clock>,
    last_count: Option<u32>,
}

impl CountFeed {
    pub fn new(store: Arc<BoundedStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            last_count: None,
        }
    }

    pub fn period(&self) -> Duration {
        period(COUNT_POLL_HZ)
    }

    /// The first poll always emits; with no detections stored the count is 0.
    pub fn poll(&mut self) -> Result<Option<CountUpdate>> {
        let update = match self.store.get_latest_detection()? {
            Some(record) => CountUpdate {
                count: record.count,
                timestamp: record.timestamp,
                confidence: record.confidence,
            },
            None => CountUpdate {
                count: 0,
                timestamp: self.clock.now_s(),
                confidence: 0.0,
            },
        };
        if self.last_count == Some(update.count) {
            return Ok(None);
        }
        self.last_count = Some(update.count);
        Ok(Some(update))
    }
}
