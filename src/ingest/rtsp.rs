//! RTSP network stream device (GStreamer).
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps.
//! The appsink keeps a single buffer and drops older ones, so a slow reader
//! always gets the most recent picture.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use gstreamer::prelude::*;

use crate::frame::{Frame, Resolution};

use super::CaptureDevice;

const PLAYING_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_TIMEOUT: Duration = Duration::from_millis(500);

pub struct RtspDevice {
    url: String,
    requested: Resolution,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    released: bool,
}

impl RtspDevice {
    /// Build the pipeline and wait for it to reach Playing.
    pub fn connect(url: &str, requested: Resolution) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        let (result, _, _) = pipeline.state(gstreamer::ClockTime::from_mseconds(
            PLAYING_TIMEOUT.as_millis() as u64,
        ));
        if let Err(err) = result {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow!("RTSP stream {} did not start: {:?}", url, err));
        }

        log::info!("RtspDevice: connected to {}", url);
        Ok(Self {
            url: url.to_string(),
            requested,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
            released: false,
        })
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl CaptureDevice for RtspDevice {
    fn describe(&self) -> String {
        format!("{} (rtsp, requested {})", self.url, self.requested)
    }

    fn is_open(&self) -> bool {
        !self.released && self.last_error.is_none()
    }

    fn grab(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("RTSP stream {} failed: {}", self.url, err));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                FRAME_TIMEOUT.as_millis() as u64,
            ))
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::from_rgb(pixels, width, height)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspDevice: failed to stop pipeline for {}: {:?}", self.url, err);
        }
        log::info!(
            "RtspDevice: released {} after {} frames (last frame {:?} ago)",
            self.url,
            self.frame_count,
            self.last_frame_at.map(|t| t.elapsed())
        );
        self.released = true;
    }
}

impl Drop for RtspDevice {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let packed = data.get(..len).context("RTSP buffer shorter than frame")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
