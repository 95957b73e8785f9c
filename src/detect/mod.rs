//! Person detection: backends, the backend registry, overlay drawing and the
//! on-demand `DetectionScheduler`.

mod backend;
mod backends;
pub mod overlay;
mod registry;
mod result;
mod scheduler;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{DetectOutcome, Detection, DetectionReport, ObjectClass};
pub use scheduler::DetectionScheduler;
