//! Retention math, independent of the storage backend.
//!
//! Detections are evicted oldest-first once the store grows past its size
//! ceiling; the error journal keeps a fixed number of newest entries. The
//! policy decides how much to remove and a `RetentionTarget` does the removal.

use anyhow::Result;

pub const DEFAULT_MAX_BYTES: u64 = 200 * 1024 * 1024;
pub const DEFAULT_EVICT_FRACTION: f64 = 0.10;
pub const DEFAULT_MIN_EVICT_ROWS: u64 = 100;
pub const DEFAULT_ERROR_LOG_CAP: u64 = 1_000;

/// Storage operations the policy drives.
pub trait RetentionTarget {
    fn size_bytes(&self) -> Result<u64>;
    fn detection_rows(&self) -> Result<u64>;
    /// Delete the `n` oldest detections; returns how many were removed.
    fn evict_oldest_detections(&self, n: u64) -> Result<u64>;
    /// Keep only the newest `keep` error entries; returns how many were removed.
    fn trim_error_log(&self, keep: u64) -> Result<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetentionPolicy {
    /// Size ceiling. Checked before each detection insert, so the store may
    /// briefly exceed it by one row plus unreclaimed pages.
    pub max_bytes: u64,
    /// Share of detection rows removed per eviction.
    pub evict_fraction: f64,
    /// Eviction needs more than this many rows and removes at least this many.
    pub min_evict_rows: u64,
    pub error_log_cap: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            evict_fraction: DEFAULT_EVICT_FRACTION,
            min_evict_rows: DEFAULT_MIN_EVICT_ROWS,
            error_log_cap: DEFAULT_ERROR_LOG_CAP,
        }
    }
}

impl RetentionPolicy {
    pub fn with_max_megabytes(max_mb: u64) -> Self {
        Self {
            max_bytes: max_mb.saturating_mul(1024 * 1024),
            ..Self::default()
        }
    }

    /// Number of oldest detection rows to evict for a store of `size_bytes`
    /// holding `rows` detections.
    pub fn eviction_count(&self, size_bytes: u64, rows: u64) -> u64 {
        if size_bytes <= self.max_bytes || rows <= self.min_evict_rows {
            return 0;
        }
        let fraction = (rows as f64 * self.evict_fraction) as u64;
        fraction.max(self.min_evict_rows).min(rows)
    }

    /// Evict detections if `target` is over the ceiling. Returns rows removed.
    pub fn enforce_size(&self, target: &dyn RetentionTarget) -> Result<u64> {
        let size = target.size_bytes()?;
        if size <= self.max_bytes {
            return Ok(0);
        }
        let rows = target.detection_rows()?;
        let n = self.eviction_count(size, rows);
        if n == 0 {
            log::debug!(
                "store over ceiling ({} > {} bytes) with only {} detections; not evicting",
                size,
                self.max_bytes,
                rows
            );
            return Ok(0);
        }
        target.evict_oldest_detections(n)
    }

    pub fn enforce_error_cap(&self, target: &dyn RetentionTarget) -> Result<u64> {
        target.trim_error_log(self.error_log_cap)
    }
}
