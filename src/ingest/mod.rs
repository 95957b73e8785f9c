//! Capture devices.
//!
//! This module provides the camera side of the acquisition pipeline:
//! - `SourceKind`: which camera to open (local device, board camera, network stream)
//! - `CaptureDevice`: an opened camera handle the acquisition loop grabs from
//! - `DeviceOpener`: turns a `SourceKind` into a `CaptureDevice`
//!
//! Backends:
//! - HTTP MJPEG/JPEG streams (always available)
//! - `stub://` synthetic streams (tests, hardware-less runs)
//! - RTSP streams (feature: rtsp-gstreamer)
//! - V4L2 local devices and board cameras (feature: ingest-v4l2)
//!
//! Opening happens on the caller's thread so failures reach `FrameSource::start`.
//! Grabbing happens on the acquisition thread; grab failures are transient.

use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use url::Url;

use crate::frame::{Frame, Resolution};
use crate::ConfigRejected;

pub mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use mjpeg::MjpegDevice;
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspDevice;
pub use synthetic::SyntheticDevice;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Device;

/// Identifier that selects the board camera.
pub const BOARD_CAMERA_SENTINEL: &str = "picamera";

const NETWORK_SCHEMES: &[&str] = &["http", "https", "rtsp", "stub"];

/// Which camera a `FrameSource` reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device by index (`/dev/videoN`).
    LocalDevice(u32),
    /// Camera on the dedicated board connector.
    BoardCamera,
    /// Network stream URL (http(s) MJPEG/JPEG, rtsp, stub).
    NetworkStream(String),
}

impl SourceKind {
    /// Classify a source identifier.
    ///
    /// Numeric ⇒ local device, the board sentinel ⇒ board camera,
    /// `scheme://...` ⇒ network stream. Anything else is rejected.
    pub fn classify(identifier: &str) -> Result<Self> {
        let identifier = identifier.trim();
        if identifier.eq_ignore_ascii_case(BOARD_CAMERA_SENTINEL) {
            return Ok(Self::BoardCamera);
        }
        if identifier.contains("://") {
            let url = Url::parse(identifier)
                .map_err(|e| ConfigRejected::new(format!("invalid stream url: {e}")))?;
            if !NETWORK_SCHEMES.contains(&url.scheme()) {
                return Err(ConfigRejected::new(format!(
                    "unsupported stream scheme '{}'; expected one of {}",
                    url.scheme(),
                    NETWORK_SCHEMES.join(", ")
                ))
                .into());
            }
            return Ok(Self::NetworkStream(identifier.to_string()));
        }
        identifier
            .parse::<u32>()
            .map(Self::LocalDevice)
            .map_err(|_| {
                ConfigRejected::new(format!("unrecognised camera source '{identifier}'")).into()
            })
    }

    /// Settings-page camera type codes: "0" webcam, "1" board camera,
    /// "2" network stream (requires `url`).
    pub fn from_type_code(code: &str, url: Option<&str>) -> Result<Self> {
        match (code.trim(), url.map(str::trim).filter(|u| !u.is_empty())) {
            ("0", _) => Ok(Self::LocalDevice(0)),
            ("1", _) => Ok(Self::BoardCamera),
            ("2", Some(url)) => match Self::classify(url)? {
                kind @ Self::NetworkStream(_) => Ok(kind),
                _ => Err(ConfigRejected::new("Invalid camera type or missing URL").into()),
            },
            _ => Err(ConfigRejected::new("Invalid camera type or missing URL").into()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::LocalDevice(_) => "local_device",
            Self::BoardCamera => "board_camera",
            Self::NetworkStream(_) => "network_stream",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalDevice(index) => write!(f, "{index}"),
            Self::BoardCamera => f.write_str(BOARD_CAMERA_SENTINEL),
            Self::NetworkStream(url) => f.write_str(url),
        }
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    /// Parses `WIDTHxHEIGHT`, e.g. `640x480`.
    fn from_str(value: &str) -> Result<Self> {
        let parsed = value
            .trim()
            .split_once(['x', 'X'])
            .and_then(|(w, h)| Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?)));
        match parsed {
            Some((width, height)) if width > 0 && height > 0 => Ok(Resolution::new(width, height)),
            _ => Err(ConfigRejected::new("Invalid resolution format").into()),
        }
    }
}

/// Camera configuration. Changing it while running goes through a full
/// stop/reconfigure/start cycle in `FrameSource`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    pub source: SourceKind,
    pub resolution: Resolution,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::LocalDevice(0),
            resolution: Resolution::default(),
        }
    }
}

/// The board camera driver is not present on this system.
#[derive(Debug)]
pub struct BoardCameraUnavailable {
    pub reason: String,
}

impl std::fmt::Display for BoardCameraUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "board camera unavailable: {}", self.reason)
    }
}

impl std::error::Error for BoardCameraUnavailable {}

/// An opened camera handle.
///
/// Implementations are driven from the acquisition thread only. `grab` may
/// block for up to one frame interval; errors are treated as transient.
pub trait CaptureDevice: Send {
    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    /// False once the handle is closed and cannot produce frames.
    fn is_open(&self) -> bool;

    /// Capture the next frame in RGB24.
    fn grab(&mut self) -> Result<Frame>;

    /// Release the underlying handle. Must be idempotent and must not fail.
    fn release(&mut self);
}

/// Opens capture devices for a `SourceKind`.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, source: &SourceKind, resolution: Resolution)
        -> Result<Box<dyn CaptureDevice>>;
}

/// Opener backed by the real drivers compiled into this build.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDeviceOpener;

impl DeviceOpener for SystemDeviceOpener {
    fn open(
        &self,
        source: &SourceKind,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureDevice>> {
        match source {
            SourceKind::LocalDevice(index) => open_local_device(*index, resolution),
            SourceKind::BoardCamera => open_board_camera(resolution),
            SourceKind::NetworkStream(url) => open_network_stream(url, resolution),
        }
    }
}

fn open_network_stream(url: &str, resolution: Resolution) -> Result<Box<dyn CaptureDevice>> {
    let parsed = Url::parse(url).map_err(|e| anyhow!("parse stream url {}: {}", url, e))?;
    match parsed.scheme() {
        "stub" => Ok(Box::new(SyntheticDevice::from_url(&parsed, resolution)?)),
        "http" | "https" => Ok(Box::new(MjpegDevice::connect(url)?)),
        "rtsp" => {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Box::new(RtspDevice::connect(url, resolution)?))
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                bail!("RTSP requires the rtsp-gstreamer feature")
            }
        }
        other => bail!("unsupported stream scheme '{}'", other),
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_local_device(index: u32, resolution: Resolution) -> Result<Box<dyn CaptureDevice>> {
    let path = format!("/dev/video{index}");
    Ok(Box::new(V4l2Device::open(&path, resolution)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_local_device(index: u32, _resolution: Resolution) -> Result<Box<dyn CaptureDevice>> {
    bail!(
        "local device {} requires the ingest-v4l2 feature",
        index
    )
}

#[cfg(feature = "ingest-v4l2")]
fn open_board_camera(resolution: Resolution) -> Result<Box<dyn CaptureDevice>> {
    let Some(path) = v4l2::find_board_camera() else {
        return Err(BoardCameraUnavailable {
            reason: "no board camera driver bound to any /dev/video node".to_string(),
        }
        .into());
    };
    Ok(Box::new(V4l2Device::open(&path, resolution)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_board_camera(_resolution: Resolution) -> Result<Box<dyn CaptureDevice>> {
    Err(BoardCameraUnavailable {
        reason: "built without the ingest-v4l2 feature".to_string(),
    }
    .into())
}
