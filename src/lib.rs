//! Headcount: live person counting over a single camera.
//!
//! # Architecture
//!
//! A background acquisition thread keeps the latest frame from one camera.
//! Detection runs on demand against that frame, annotates it, and records
//! the person count in a size-bounded SQLite store that also holds settings
//! and an error journal.
//!
//! # Module Structure
//!
//! - `frame`: RGB frames, resolution, latest-frame buffer
//! - `ingest`: capture devices (local, board camera, http/rtsp streams)
//! - `camera`: `FrameSource`, the acquisition lifecycle
//! - `detect`: detector backends, registry, overlay, `DetectionScheduler`
//! - `storage`: `BoundedStore` and its retention policy
//! - `feed`: MJPEG and count-change streaming suppliers
//! - `query`: settings, history and log queries for the outer layer
//! - `config`: process configuration

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod camera;
pub mod clock;
pub mod config;
pub mod detect;
pub mod feed;
pub mod frame;
pub mod ingest;
pub mod query;
pub mod storage;

pub use camera::{CameraInfo, FrameSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::HeadcountConfig;
pub use detect::{
    BackendRegistry, DetectOutcome, Detection, DetectionReport, DetectionScheduler,
    DetectorBackend, ObjectClass, SharedDetector, StubBackend,
};
pub use frame::{Frame, FrameBuffer, Resolution};
pub use ingest::{CameraConfig, SourceKind};
pub use query::{ProbeReport, QuerySurface};
pub use storage::{BoundedStore, DetectionRecord, ErrorLogEntry, RetentionPolicy};

/// A configuration value was refused. Nothing was changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRejected {
    message: String,
}

impl ConfigRejected {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ConfigRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigRejected {}

/// URI for a private in-memory database that several connections can share.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:headcount_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
