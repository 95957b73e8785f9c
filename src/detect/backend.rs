use anyhow::Result;

use super::result::Detection;

/// Object detector capability.
///
/// Implementations are driven behind a `Mutex` by `DetectionScheduler`, so
/// `detect` may keep per-call scratch state. Pixels are RGB24 and are only
/// borrowed for the duration of the call.
pub trait DetectorBackend: Send {
    /// Backend identifier used by the registry.
    fn name(&self) -> &'static str;

    /// Load model weights. Detecting before a successful load is an error.
    fn load_model(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    /// Minimum score a detection must reach to be reported.
    fn set_confidence_threshold(&mut self, threshold: f32);

    /// Run detection on one frame. Boxes are in pixel coordinates.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;
}
