//! Size-bounded persistence for detections, settings and the error journal.

mod retention;
mod store;

pub use retention::{
    RetentionPolicy, RetentionTarget, DEFAULT_ERROR_LOG_CAP, DEFAULT_EVICT_FRACTION,
    DEFAULT_MAX_BYTES, DEFAULT_MIN_EVICT_ROWS,
};
pub use store::{BoundedStore, DetectionRecord, ErrorLogEntry};
