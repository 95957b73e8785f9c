//! HTTP network camera device.
//!
//! Reads `multipart/x-mixed-replace` MJPEG streams, or polls a single-JPEG
//! snapshot endpoint when the server answers with a plain image. Frames are
//! decoded in memory with `image`.
//!
//! The initial connection is made in `connect` so an unreachable camera is an
//! open failure. A stream that drops mid-run is reconnected on the next grab.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use crate::frame::Frame;

use super::CaptureDevice;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegDevice {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    frame_count: u64,
    released: bool,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegDevice {
    /// Connect to `url`. Fails when the camera cannot be reached.
    pub fn connect(url: &str) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let mut device = Self {
            url: url.to_string(),
            agent,
            stream: None,
            frame_count: 0,
            released: false,
        };
        device.open_stream()?;
        log::info!("MjpegDevice: connected to {}", device.url);
        Ok(device)
    }

    fn open_stream(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        Ok(())
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        if self.stream.is_none() {
            self.open_stream()?;
        }
        let result = match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) => fetch_single_jpeg(&self.agent, &self.url),
            None => Err(anyhow!("http stream not connected")),
        };
        if result.is_err() {
            // Reconnect on the next grab.
            self.stream = None;
        }
        result
    }
}

impl CaptureDevice for MjpegDevice {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn is_open(&self) -> bool {
        !self.released
    }

    fn grab(&mut self) -> Result<Frame> {
        if self.released {
            return Err(anyhow!("http stream released"));
        }
        let jpeg = self.next_jpeg()?;
        let frame = decode_jpeg(&jpeg)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            log::info!(
                "MjpegDevice: released {} after {} frames",
                self.url,
                self.frame_count
            );
        }
        self.stream = None;
        self.released = true;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    Frame::from_rgb(rgb.into_raw(), width, height)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
