use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::open_db_connection;

use super::retention::{RetentionPolicy, RetentionTarget};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One stored detection pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub timestamp: i64,
    pub count: u32,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorLogEntry {
    pub timestamp: i64,
    pub message: String,
    pub resolved: bool,
}

/// Size-bounded SQLite store for detections, settings and the error journal.
///
/// All mutations go through one writer connection under a mutex, so the size
/// check, eviction and insert of a detection are atomic with respect to other
/// writers in this process. File-backed stores read through a second
/// connection; WAL lets those reads run alongside a write and see either the
/// state before it or after it.
///
/// Detections are keyed by the second they were stored. Two passes stored in
/// the same second keep only the later one.
pub struct BoundedStore {
    path: String,
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
}

impl BoundedStore {
    pub fn open(path: &str, policy: RetentionPolicy) -> Result<Self> {
        Self::open_with_clock(path, policy, Arc::new(SystemClock))
    }

    /// In-memory store with the default policy; nothing survives the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:", RetentionPolicy::default())
    }

    pub fn open_with_clock(
        path: &str,
        policy: RetentionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let writer = open_db_connection(path).with_context(|| format!("open store {}", path))?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&writer)?;

        let reader = if is_memory_path(path) {
            None
        } else {
            let conn = open_db_connection(path)
                .with_context(|| format!("open store reader {}", path))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Some(Mutex::new(conn))
        };

        log::info!(
            "store opened at {} (ceiling {} bytes, error log cap {})",
            path,
            policy.max_bytes,
            policy.error_log_cap
        );
        Ok(Self {
            path: path.to_string(),
            writer: Mutex::new(writer),
            reader,
            policy,
            clock,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    // ------------------------------------------------------------------------
    // Detections
    // ------------------------------------------------------------------------

    /// Record one detection pass, evicting old rows first when over the
    /// ceiling. Failures are written to the error log and reported as `false`.
    ///
    /// A row already stored for the current second is never replaced; the
    /// later pass is dropped and reported as `false` without a journal entry.
    pub fn store_detection(&self, count: u32, confidence: f32) -> bool {
        match self.try_store_detection(count, confidence) {
            Ok(inserted) => inserted,
            Err(err) => {
                log::warn!("storing detection failed: {:#}", err);
                self.log_error(&format!("Error storing detection: {:#}", err));
                false
            }
        }
    }

    fn try_store_detection(&self, count: u32, confidence: f32) -> Result<bool> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let evicted = self.policy.enforce_size(&SqliteTarget(&tx))?;
        let timestamp = self.clock.now_s();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO detections (timestamp, count, confidence) VALUES (?1, ?2, ?3)",
            params![timestamp, count, confidence as f64],
        )?;
        tx.commit()?;

        if evicted > 0 {
            log::info!("store over ceiling: evicted {} oldest detections", evicted);
            reclaim_space(&conn);
        }
        if inserted == 0 {
            log::debug!("detection at {} already stored; dropping later pass", timestamp);
        }
        Ok(inserted == 1)
    }

    /// Detections stored within `window` of now, oldest first.
    pub fn get_recent_detections(&self, window: Duration) -> Result<Vec<DetectionRecord>> {
        let since = self.clock.now_s() - window.as_secs() as i64;
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, count, confidence FROM detections
                 WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![since], detection_from_row)?;
            rows.collect()
        })
    }

    pub fn get_latest_detection(&self) -> Result<Option<DetectionRecord>> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT timestamp, count, confidence FROM detections
                 ORDER BY timestamp DESC LIMIT 1",
                [],
                detection_from_row,
            )
            .optional()
        })
    }

    /// One page of detections, newest first, plus the total row count.
    /// Pages are 1-based; page 0 or a zero page size is rejected.
    pub fn get_paginated_detections(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<DetectionRecord>, u64)> {
        if page == 0 {
            bail!("page must be 1 or greater");
        }
        if page_size == 0 {
            bail!("page size must be 1 or greater");
        }
        let offset = (page as i64 - 1) * page_size as i64;
        self.with_reader(|conn| {
            let tx = conn.unchecked_transaction()?;
            let total: i64 = tx.query_row("SELECT COUNT(*) FROM detections", [], |r| r.get(0))?;
            let records = {
                let mut stmt = tx.prepare(
                    "SELECT timestamp, count, confidence FROM detections
                     ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![page_size, offset], detection_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.finish()?;
            Ok((records, total.max(0) as u64))
        })
    }

    pub fn detection_count(&self) -> Result<u64> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM detections", [], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
    }

    /// Logical database size (`page_count * page_size`).
    pub fn size_bytes(&self) -> Result<u64> {
        self.with_reader(db_size_bytes)
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    /// Stored value for `key`, or `default` when absent or unreadable.
    pub fn get_setting(&self, key: &str, default: &str) -> String {
        let value = self.with_reader(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |r| r.get::<_, String>(0),
            )
            .optional()
        });
        match value {
            Ok(Some(value)) => value,
            Ok(None) => default.to_string(),
            Err(err) => {
                log::warn!("reading setting {} failed: {:#}", key, err);
                default.to_string()
            }
        }
    }

    /// Upsert one setting, then reclaim free pages best-effort.
    pub fn set_setting(&self, key: &str, value: &str) -> bool {
        let mut entries = BTreeMap::new();
        entries.insert(key.to_string(), value.to_string());
        self.save_settings(&entries)
    }

    pub fn get_settings(&self) -> Result<BTreeMap<String, String>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect()
        })
    }

    /// Upsert several settings in one transaction.
    pub fn save_settings(&self, entries: &BTreeMap<String, String>) -> bool {
        let result = self.lock_writer().and_then(|mut conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )?;
                for (key, value) in entries {
                    stmt.execute(params![key, value])?;
                }
            }
            tx.commit()?;
            reclaim_space(&conn);
            Ok(())
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!("saving settings failed: {:#}", err);
                self.log_error(&format!("Error saving settings: {:#}", err));
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Error journal
    // ------------------------------------------------------------------------

    /// Append an unresolved entry and trim the journal to its cap.
    pub fn log_error(&self, message: &str) -> bool {
        self.append_journal(message, false)
    }

    /// Append an entry that starts out resolved (informational messages).
    pub(crate) fn append_resolved(&self, message: &str) -> bool {
        self.append_journal(message, true)
    }

    fn append_journal(&self, message: &str, resolved: bool) -> bool {
        match self.try_append_journal(message, resolved) {
            Ok(()) => true,
            Err(err) => {
                // Nowhere left to record it but the process log.
                log::error!("error log write failed: {:#} (message: {})", err, message);
                false
            }
        }
    }

    fn try_append_journal(&self, message: &str, resolved: bool) -> Result<()> {
        let mut conn = self.lock_writer()?;
        let tx = conn.transaction()?;
        let now = self.clock.now_s();
        let newest: Option<i64> =
            tx.query_row("SELECT MAX(timestamp) FROM errors", [], |r| r.get(0))?;
        // Keys stay unique when several entries land in the same second.
        let timestamp = newest.map_or(now, |newest| now.max(newest + 1));
        tx.execute(
            "INSERT INTO errors (timestamp, message, resolved) VALUES (?1, ?2, ?3)",
            params![timestamp, message, resolved],
        )?;
        self.policy.enforce_error_cap(&SqliteTarget(&tx))?;
        tx.commit()?;
        Ok(())
    }

    /// Entries with the given `resolved` flag, newest first.
    pub fn get_errors(&self, resolved: bool, limit: u32) -> Result<Vec<ErrorLogEntry>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, message, resolved FROM errors
                 WHERE resolved = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![resolved, limit], |r| {
                Ok(ErrorLogEntry {
                    timestamp: r.get(0)?,
                    message: r.get(1)?,
                    resolved: r.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Flip an unresolved entry to resolved. False when no unresolved entry
    /// has that timestamp.
    pub fn mark_resolved(&self, timestamp: i64) -> bool {
        let result = self.lock_writer().and_then(|conn| {
            Ok(conn.execute(
                "UPDATE errors SET resolved = 1 WHERE timestamp = ?1 AND resolved = 0",
                params![timestamp],
            )?)
        });
        match result {
            Ok(changed) => changed == 1,
            Err(err) => {
                log::warn!("mark_resolved({}) failed: {:#}", timestamp, err);
                false
            }
        }
    }

    /// Delete resolved entries; returns how many were removed.
    pub fn clear_resolved(&self) -> usize {
        let result = self.lock_writer().and_then(|conn| {
            Ok(conn.execute("DELETE FROM errors WHERE resolved = 1", [])?)
        });
        match result {
            Ok(removed) => removed,
            Err(err) => {
                log::warn!("clear_resolved failed: {:#}", err);
                0
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("store writer lock poisoned"))
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mutex = self.reader.as_ref().unwrap_or(&self.writer);
        let conn = mutex
            .lock()
            .map_err(|_| anyhow!("store reader lock poisoned"))?;
        Ok(f(&conn)?)
    }
}

/// `auto_vacuum` only takes effect on a database without tables, so it is set
/// before the schema is created.
fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA auto_vacuum=INCREMENTAL;
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS detections (
          timestamp INTEGER PRIMARY KEY,
          count INTEGER NOT NULL,
          confidence REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS errors (
          timestamp INTEGER PRIMARY KEY,
          message TEXT NOT NULL,
          resolved INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .context("create store schema")?;
    Ok(())
}

fn is_memory_path(path: &str) -> bool {
    path == ":memory:" || path.contains("mode=memory")
}

fn detection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionRecord> {
    Ok(DetectionRecord {
        timestamp: row.get(0)?,
        count: row.get(1)?,
        confidence: row.get::<_, f64>(2)? as f32,
    })
}

fn db_size_bytes(conn: &Connection) -> rusqlite::Result<u64> {
    let pages: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
    Ok((pages.max(0) * page_size.max(0)) as u64)
}

/// Return free pages to the filesystem. Failure leaves the store valid.
fn reclaim_space(conn: &Connection) {
    if let Err(err) = conn.execute_batch("PRAGMA incremental_vacuum;") {
        log::warn!("incremental vacuum failed: {}", err);
    }
}

struct SqliteTarget<'a>(&'a Connection);

impl RetentionTarget for SqliteTarget<'_> {
    fn size_bytes(&self) -> Result<u64> {
        Ok(db_size_bytes(self.0)?)
    }

    fn detection_rows(&self) -> Result<u64> {
        let n: i64 = self
            .0
            .query_row("SELECT COUNT(*) FROM detections", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn evict_oldest_detections(&self, n: u64) -> Result<u64> {
        let removed = self.0.execute(
            "DELETE FROM detections WHERE timestamp IN
             (SELECT timestamp FROM detections ORDER BY timestamp ASC LIMIT ?1)",
            params![n as i64],
        )?;
        Ok(removed as u64)
    }

    fn trim_error_log(&self, keep: u64) -> Result<u64> {
        let removed = self.0.execute(
            "DELETE FROM errors WHERE timestamp NOT IN
             (SELECT timestamp FROM errors ORDER BY timestamp DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start: i64) -> Result<(BoundedStore, Arc<ManualClock>)> {
        let clock = Arc::new(ManualClock::new(start));
        let store =
            BoundedStore::open_with_clock(":memory:", RetentionPolicy::default(), clock.clone())?;
        Ok((store, clock))
    }

    #[test]
    fn settings_upsert_and_default() -> Result<()> {
        let (store, _) = store_at(1_000)?;
        assert_eq!(store.get_setting("camera.type", "0"), "0");
        assert!(store.set_setting("camera.type", "2"));
        assert!(store.set_setting("camera.type", "1"));
        assert_eq!(store.get_setting("camera.type", "0"), "1");
        assert_eq!(store.get_settings()?.len(), 1);
        Ok(())
    }

    #[test]
    fn recent_window_and_latest() -> Result<()> {
        let (store, clock) = store_at(10_000)?;
        assert!(store.get_latest_detection()?.is_none());
        assert!(store.store_detection(1, 0.5));
        clock.advance(100);
        assert!(store.store_detection(3, 0.75));
        clock.advance(10);

        let recent = store.get_recent_detections(Duration::from_secs(50))?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].count, 3);

        let all = store.get_recent_detections(Duration::from_secs(1_000))?;
        assert_eq!(all.iter().map(|r| r.count).collect::<Vec<_>>(), vec![1, 3]);

        let latest = store.get_latest_detection()?.ok_or_else(|| anyhow!("no row"))?;
        assert_eq!((latest.timestamp, latest.count), (10_100, 3));
        Ok(())
    }

    #[test]
    fn same_second_detection_never_overwrites() -> Result<()> {
        let (store, _) = store_at(5_000)?;
        assert!(store.store_detection(7, 0.9));
        assert!(!store.store_detection(1, 0.2));
        assert_eq!(store.detection_count()?, 1);
        let latest = store.get_latest_detection()?.ok_or_else(|| anyhow!("no row"))?;
        assert_eq!(
            latest,
            DetectionRecord {
                timestamp: 5_000,
                count: 7,
                confidence: 0.9
            }
        );
        assert!(store.get_errors(false, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn same_second_errors_get_distinct_keys() -> Result<()> {
        let (store, _) = store_at(7_000)?;
        assert!(store.log_error("first"));
        assert!(store.log_error("second"));
        let errors = store.get_errors(false, 10)?;
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "second");
        assert_eq!(errors[0].timestamp, 7_001);
        Ok(())
    }

    #[test]
    fn invalid_pages_are_rejected() -> Result<()> {
        let (store, _) = store_at(1)?;
        assert!(store.get_paginated_detections(0, 10).is_err());
        assert!(store.get_paginated_detections(1, 0).is_err());
        let (rows, total) = store.get_paginated_detections(5, 10)?;
        assert!(rows.is_empty());
        assert_eq!(total, 0);
        Ok(())
    }

    #[test]
    fn mark_resolved_transitions_once() -> Result<()> {
        let (store, _) = store_at(100)?;
        assert!(store.log_error("disk hiccup"));
        let ts = store.get_errors(false, 1)?[0].timestamp;
        assert!(store.mark_resolved(ts));
        assert!(!store.mark_resolved(ts));
        assert!(!store.mark_resolved(ts + 99));
        Ok(())
    }

    #[test]
    fn size_is_reported() -> Result<()> {
        let (store, _) = store_at(1)?;
        assert!(store.size_bytes()? > 0);
        Ok(())
    }
}
