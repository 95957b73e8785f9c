//! Frame container and the single-slot frame buffer.
//!
//! - `Frame`: one decoded RGB24 image plus capture time and FPS sample.
//! - `FrameBuffer`: single-slot, overwrite-on-write mailbox between the
//!   acquisition thread and every reader.
//!
//! The buffer lock is held only long enough to swap or clone an `Arc`; the
//! defensive copy handed to readers is made after the lock is dropped. A
//! stored frame is never mutated, so a reader cannot observe a frame that is
//! half old and half new.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Interleaved RGB.
pub const CHANNELS: u32 = 3;

/// Frame width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS as usize
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded frame. Pixel data is private and immutable once built.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time, seconds since the epoch.
    pub captured_at: f64,
    /// Instantaneous FPS at capture; `None` for the first frame of a session.
    pub fps: Option<f32>,
}

impl Frame {
    /// Build a frame from RGB24 pixels. The length must match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = Resolution::new(width, height).byte_len();
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: epoch_secs_f64(),
            fps: None,
        })
    }

    /// All-black frame at the given resolution.
    pub fn blank(resolution: Resolution) -> Self {
        Self {
            data: vec![0u8; resolution.byte_len()],
            width: resolution.width,
            height: resolution.height,
            captured_at: epoch_secs_f64(),
            fps: None,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn channels(&self) -> u32 {
        CHANNELS
    }

    pub(crate) fn with_fps(mut self, fps: Option<f32>) -> Self {
        self.fps = fps;
        self
    }

    /// Resize to `target`, or return `self` untouched when already that size.
    pub fn resized(self, target: Resolution) -> Result<Self> {
        if self.resolution() == target {
            return Ok(self);
        }
        let Self {
            data,
            width,
            height,
            captured_at,
            fps,
        } = self;
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        let resized =
            image::imageops::resize(&image, target.width, target.height, FilterType::Triangle);
        Ok(Self {
            data: resized.into_raw(),
            width: target.width,
            height: target.height,
            captured_at,
            fps,
        })
    }

    /// Copy into an `image` buffer for drawing or encoding.
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    pub fn from_image(image: RgbImage, captured_at: f64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            captured_at,
            fps: None,
        }
    }

    /// JPEG-encode at `quality` (clamped to 1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode jpeg")?;
        Ok(out)
    }
}

/// Single-slot frame mailbox. One writer (the acquisition loop), any number
/// of readers.
///
/// Each writer publishes under the session it was handed by `open_session`.
/// Opening a new session or clearing the slot retires every earlier session,
/// so a writer that outlived its `release` can no longer publish.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    session: u64,
    frame: Option<Arc<Frame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the slot and start a new writer session.
    pub fn open_session(&self) -> u64 {
        let (session, previous) = {
            let mut slot = self.lock_slot();
            slot.session += 1;
            (slot.session, slot.frame.take())
        };
        drop(previous);
        session
    }

    /// Replace the current frame if `session` is still the live one.
    /// Returns false for a retired session; the frame is discarded.
    pub fn publish(&self, session: u64, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        let previous = {
            let mut slot = self.lock_slot();
            if slot.session != session {
                return false;
            }
            slot.frame.replace(frame)
        };
        // Old frame is dropped outside the lock.
        drop(previous);
        true
    }

    /// Copy of the latest frame, or `None` when nothing was captured yet.
    pub fn latest(&self) -> Option<Frame> {
        let shared = self.lock_slot().frame.clone()?;
        Some(Frame::clone(&shared))
    }

    pub fn has_frame(&self) -> bool {
        self.lock_slot().frame.is_some()
    }

    /// Empty the slot and retire the current writer session.
    pub fn clear(&self) {
        let previous = {
            let mut slot = self.lock_slot();
            slot.session += 1;
            slot.frame.take()
        };
        drop(previous);
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(value: u8, width: u32, height: u32) -> Frame {
        let len = Resolution::new(width, height).byte_len();
        Frame::from_rgb(vec![value; len], width, height).unwrap()
    }

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn buffer_starts_empty_and_hands_out_copies() {
        let buffer = FrameBuffer::new();
        assert!(buffer.latest().is_none());

        let session = buffer.open_session();
        assert!(buffer.publish(session, solid(7, 4, 4)));
        let first = buffer.latest().expect("frame");
        assert!(buffer.publish(session, solid(9, 4, 4)));

        // The earlier copy is unaffected by the overwrite.
        assert!(first.pixels().iter().all(|&p| p == 7));
        let second = buffer.latest().expect("frame");
        assert!(second.pixels().iter().all(|&p| p == 9));
    }

    #[test]
    fn clear_empties_the_slot() {
        let buffer = FrameBuffer::new();
        let session = buffer.open_session();
        assert!(buffer.publish(session, solid(1, 2, 2)));
        assert!(buffer.has_frame());
        buffer.clear();
        assert!(!buffer.has_frame());
    }

    #[test]
    fn retired_sessions_cannot_publish() {
        let buffer = FrameBuffer::new();
        let old = buffer.open_session();
        let current = buffer.open_session();
        assert!(!buffer.publish(old, solid(3, 2, 2)));
        assert!(!buffer.has_frame());

        assert!(buffer.publish(current, solid(4, 2, 2)));
        buffer.clear();
        assert!(!buffer.publish(current, solid(5, 2, 2)));
        assert!(buffer.latest().is_none());
    }

    #[test]
    fn resize_changes_dimensions_only_when_needed() -> Result<()> {
        let frame = solid(100, 8, 6);
        let same = frame.clone().resized(Resolution::new(8, 6))?;
        assert_eq!(same.pixels(), frame.pixels());

        let smaller = frame.resized(Resolution::new(4, 3))?;
        assert_eq!(smaller.resolution(), Resolution::new(4, 3));
        assert_eq!(smaller.pixels().len(), 4 * 3 * 3);
        Ok(())
    }

    #[test]
    fn jpeg_encoding_round_trips_dimensions() -> Result<()> {
        let frame = Frame::blank(Resolution::new(32, 24));
        let jpeg = frame.encode_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 24);
        Ok(())
    }
}
