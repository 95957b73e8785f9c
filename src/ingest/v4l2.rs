//! V4L2 local capture device.
//!
//! Opens `/dev/videoN` (or the board camera node), asks for RGB3 at the
//! requested size, and falls back to whatever the driver negotiates. Buffers
//! in other layouts are converted to RGB24 by `normalize`.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use crate::frame::{Frame, Resolution};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::CaptureDevice;

/// Driver names used by board-connector camera stacks.
const BOARD_CAMERA_DRIVERS: &[&str] = &["unicam", "bcm2835", "mmal", "rp1-cfe"];

pub struct V4l2Device {
    path: String,
    state: Option<V4l2State>,
    format: PixelFormat,
    active: Resolution,
    frame_count: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Device {
    pub fn open(path: &str, requested: Resolution) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = requested.width;
        format.height = requested.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Device: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} negotiated unsupported pixel format {}",
                path,
                format.fourcc
            )
        })?;
        let active = Resolution::new(format.width, format.height);

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Device: opened {} ({} {:?})",
            path,
            active,
            pixel_format
        );
        Ok(Self {
            path: path.to_string(),
            state: Some(state),
            format: pixel_format,
            active,
            frame_count: 0,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn describe(&self) -> String {
        format!("{} ({})", self.path, self.active)
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn grab(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not open")?;
        let (width, height, format) = (self.active.width, self.active.height, self.format);
        let (pixels, w, h) = state.with_mut(|fields| -> Result<_> {
            let (buf, _meta) = fields.stream.next().context("capture v4l2 frame")?;
            normalize_to_rgb(buf, width, height, format)
        })?;

        self.frame_count += 1;
        Frame::from_rgb(pixels, w, h)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Device: released {} after {} frames",
                self.path,
                self.frame_count
            );
        }
    }
}

/// Device node of the board-connector camera, if one is present.
pub fn find_board_camera() -> Option<String> {
    for node in v4l::context::enum_devices() {
        let path = node.path().to_string_lossy().into_owned();
        let Ok(device) = v4l::Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            continue;
        }
        let driver = caps.driver.to_lowercase();
        if BOARD_CAMERA_DRIVERS.iter().any(|d| driver.contains(d)) {
            log::debug!("board camera found at {} (driver {})", path, caps.driver);
            return Some(path);
        }
    }
    None
}
