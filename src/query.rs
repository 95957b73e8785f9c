//! Query surface used by the outer routing layer.
//!
//! Thin pass-throughs to the store plus settings handling. Settings documents
//! are nested JSON objects; they are stored flattened under dotted keys
//! (`camera.resolution`) with each leaf JSON-encoded.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::camera::{wait_for_frame, FrameSource};
use crate::detect::DetectionScheduler;
use crate::frame::Resolution;
use crate::ingest::{CameraConfig, DeviceOpener, SourceKind};
use crate::storage::{BoundedStore, DetectionRecord, ErrorLogEntry};

const SECONDS_PER_DAY: u64 = 86_400;

/// Partial settings document accepted by `apply_settings`. Unknown sections
/// are kept and saved as-is.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub camera: Option<CameraUpdate>,
    #[serde(default)]
    pub detection: Option<DetectionUpdate>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CameraUpdate {
    #[serde(rename = "type")]
    pub type_code: Option<String>,
    pub url: Option<String>,
    pub resolution: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectionUpdate {
    pub confidence: Option<f32>,
    pub enabled: Option<bool>,
}

pub struct QuerySurface {
    store: Arc<BoundedStore>,
    source: Arc<FrameSource>,
    scheduler: Arc<DetectionScheduler>,
}

impl QuerySurface {
    pub fn new(
        store: Arc<BoundedStore>,
        source: Arc<FrameSource>,
        scheduler: Arc<DetectionScheduler>,
    ) -> Self {
        Self {
            store,
            source,
            scheduler,
        }
    }

    pub fn get_settings(&self) -> Result<Value> {
        Ok(unflatten(&self.store.get_settings()?))
    }

    pub fn save_settings(&self, settings: &Value) -> bool {
        let mut flat = BTreeMap::new();
        flatten("", settings, &mut flat);
        self.store.save_settings(&flat)
    }

    /// Validate and apply a settings document, then save it.
    ///
    /// Resolution and camera type are checked before anything changes, so a
    /// document that fails validation leaves camera, detector and store
    /// untouched. If the new camera then fails to open, the error is returned
    /// with the new camera configuration in place but stopped, and the
    /// document is not saved.
    pub fn apply_settings(&self, settings: &Value) -> Result<()> {
        let update: SettingsUpdate = serde_json::from_value(settings.clone())
            .map_err(|e| anyhow!("invalid settings document: {}", e))?;

        if let Some(camera) = &update.camera {
            let resolution = camera
                .resolution
                .as_deref()
                .map(str::parse::<Resolution>)
                .transpose()?;
            let source = camera
                .type_code
                .as_deref()
                .map(|code| SourceKind::from_type_code(code, camera.url.as_deref()))
                .transpose()?;

            if let Some(resolution) = resolution {
                self.source.set_resolution(resolution)?;
            }
            if let Some(source) = source {
                self.source.set_source(source)?;
            }
        }

        if let Some(detection) = &update.detection {
            if let Some(confidence) = detection.confidence {
                self.scheduler.set_confidence_threshold(confidence);
            }
            if let Some(enabled) = detection.enabled {
                self.scheduler.set_detector_enabled(enabled);
            }
        }

        if !self.save_settings(settings) {
            return Err(anyhow!("settings applied but could not be saved"));
        }
        Ok(())
    }

    pub fn get_latest_detection(&self) -> Result<Option<DetectionRecord>> {
        self.store.get_latest_detection()
    }

    pub fn get_detection_history(&self, days: u32) -> Result<Vec<DetectionRecord>> {
        self.store
            .get_recent_detections(Duration::from_secs(days as u64 * SECONDS_PER_DAY))
    }

    pub fn get_paginated_detections(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<DetectionRecord>, u64)> {
        self.store.get_paginated_detections(page, page_size)
    }

    /// Open errors, newest first.
    pub fn get_error_logs(&self, limit: u32) -> Result<Vec<ErrorLogEntry>> {
        self.store.get_errors(false, limit)
    }

    pub fn add_error_log(&self, message: &str, stack_trace: Option<&str>) -> bool {
        match stack_trace.filter(|t| !t.trim().is_empty()) {
            Some(trace) => self.store.log_error(&format!("{}\n{}", message, trace)),
            None => self.store.log_error(message),
        }
    }

    /// Informational journal entries, newest first.
    pub fn get_system_logs(&self, limit: u32) -> Result<Vec<ErrorLogEntry>> {
        self.store.get_errors(true, limit)
    }

    pub fn add_system_log(&self, message: &str, level: &str) -> bool {
        self.store
            .append_resolved(&format!("[{}] {}", level.to_lowercase(), message))
    }
}

// ----------------------------------------------------------------------------
// Camera probe
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeReport {
    Ok { resolution: String },
    Error { message: String },
}

impl ProbeReport {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Open a throwaway camera with settings-page parameters, wait up to `wait`
/// for one frame, and release it.
pub fn probe_camera(
    opener: Arc<dyn DeviceOpener>,
    type_code: &str,
    url: Option<&str>,
    resolution: Option<&str>,
    wait: Duration,
) -> ProbeReport {
    let resolution = match resolution.filter(|r| !r.trim().is_empty()) {
        Some(raw) => match raw.parse::<Resolution>() {
            Ok(resolution) => resolution,
            Err(err) => return ProbeReport::error(err.to_string()),
        },
        None => Resolution::default(),
    };
    let source = match SourceKind::from_type_code(type_code, url) {
        Ok(source) => source,
        Err(err) => return ProbeReport::error(err.to_string()),
    };

    let camera = FrameSource::with_opener(CameraConfig { source, resolution }, opener);
    if let Err(err) = camera.start() {
        log::info!("camera probe failed: {:#}", err);
        return ProbeReport::error("Failed to connect to camera");
    }
    let frame = wait_for_frame(&camera, wait, |_| true);
    camera.release();
    match frame {
        Ok(frame) => ProbeReport::Ok {
            resolution: frame.resolution().to_string(),
        },
        Err(_) => ProbeReport::error("Connected but failed to get frame"),
    }
}

// ----------------------------------------------------------------------------
// Dotted-key flattening
// ----------------------------------------------------------------------------

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        other if !prefix.is_empty() => {
            out.insert(prefix.to_string(), other.to_string());
        }
        _ => {}
    }
}

fn unflatten(flat: &BTreeMap<String, String>) -> Value {
    let mut root = Map::new();
    for (key, raw) in flat {
        // Values written by other tools may be bare strings.
        let leaf =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        insert_path(&mut root, key, leaf);
    }
    Value::Object(root)
}

fn insert_path(root: &mut Map<String, Value>, key: &str, leaf: Value) {
    let mut parts = key.split('.').peekable();
    let mut node = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            node.insert(part.to_string(), leaf);
            return;
        }
        let child = node
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        let Value::Object(map) = child else {
            return;
        };
        node = map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{SharedDetector, StubBackend};
    use crate::ingest::SystemDeviceOpener;
    use crate::ConfigRejected;
    use serde_json::json;
    use std::sync::Mutex;

    fn surface() -> Result<(QuerySurface, Arc<FrameSource>, Arc<DetectionScheduler>)> {
        let store = Arc::new(BoundedStore::open_in_memory()?);
        let source = Arc::new(FrameSource::new(CameraConfig {
            source: SourceKind::NetworkStream("stub://pattern".to_string()),
            resolution: Resolution::new(32, 24),
        }));
        let detector: SharedDetector = Arc::new(Mutex::new(StubBackend::new()));
        let scheduler = Arc::new(DetectionScheduler::new(
            Arc::clone(&source),
            detector,
            Arc::clone(&store),
        ));
        let surface = QuerySurface::new(store, Arc::clone(&source), Arc::clone(&scheduler));
        Ok((surface, source, scheduler))
    }

    #[test]
    fn settings_round_trip_through_dotted_keys() -> Result<()> {
        let (surface, _, _) = surface()?;
        let doc = json!({
            "camera": {"type": "2", "url": "stub://pattern", "resolution": "320x240"},
            "detection": {"confidence": 0.65, "enabled": true},
            "ui": {"theme": "dark"}
        });
        assert!(surface.save_settings(&doc));
        assert_eq!(surface.get_settings()?, doc);
        Ok(())
    }

    #[test]
    fn apply_settings_reconfigures_camera_and_detector() -> Result<()> {
        let (surface, source, scheduler) = surface()?;
        let doc = json!({
            "camera": {"type": "2", "url": "stub://other", "resolution": "64x48"},
            "detection": {"confidence": 0.7, "enabled": false}
        });
        surface.apply_settings(&doc)?;

        let config = source.config();
        assert_eq!(config.resolution, Resolution::new(64, 48));
        assert_eq!(config.source, SourceKind::NetworkStream("stub://other".to_string()));
        assert!((scheduler.confidence_threshold() - 0.7).abs() < 1e-6);
        assert!(!scheduler.detector_enabled());
        assert_eq!(surface.get_settings()?["camera"]["resolution"], "64x48");
        Ok(())
    }

    #[test]
    fn rejected_settings_change_nothing() -> Result<()> {
        let (surface, source, _) = surface()?;
        let before = source.config();

        let bad_resolution = json!({"camera": {"type": "0", "resolution": "big"}});
        let err = surface.apply_settings(&bad_resolution).unwrap_err();
        assert!(err.downcast_ref::<ConfigRejected>().is_some());

        let missing_url = json!({"camera": {"type": "2", "resolution": "64x48"}});
        let err = surface.apply_settings(&missing_url).unwrap_err();
        assert_eq!(err.to_string(), "Invalid camera type or missing URL");

        assert_eq!(source.config(), before);
        assert!(surface.get_settings()?.as_object().is_some_and(|m| m.is_empty()));
        Ok(())
    }

    #[test]
    fn camera_open_failure_is_returned_and_not_saved() -> Result<()> {
        let (surface, source, _) = surface()?;
        source.start()?;
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();

        let doc = json!({
            "camera": {"type": "2", "url": format!("http://127.0.0.1:{port}/stream")}
        });
        assert!(surface.apply_settings(&doc).is_err());
        assert!(!source.is_running());
        assert!(surface.get_settings()?.as_object().is_some_and(|m| m.is_empty()));
        Ok(())
    }

    #[test]
    fn system_logs_are_kept_apart_from_errors() -> Result<()> {
        let (surface, _, _) = surface()?;
        assert!(surface.add_system_log("camera restarted", "INFO"));
        assert!(surface.add_error_log("encode failed", Some("at frame.rs:10")));

        let errors = surface.get_error_logs(10)?;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "encode failed\nat frame.rs:10");

        let logs = surface.get_system_logs(10)?;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "[info] camera restarted");
        Ok(())
    }

    #[test]
    fn probe_reports_status() {
        let opener: Arc<dyn DeviceOpener> = Arc::new(SystemDeviceOpener);
        let wait = Duration::from_secs(2);

        let ok = probe_camera(opener.clone(), "2", Some("stub://pattern"), Some("48x32"), wait);
        assert_eq!(
            ok,
            ProbeReport::Ok {
                resolution: "48x32".to_string()
            }
        );

        let bad = probe_camera(opener.clone(), "2", None, Some("48x32"), wait);
        assert_eq!(bad, ProbeReport::error("Invalid camera type or missing URL"));

        let bad = probe_camera(opener, "0", None, Some("48by32"), wait);
        assert_eq!(bad, ProbeReport::error("Invalid resolution format"));
    }
}
