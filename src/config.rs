use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::Resolution;
use crate::ingest::{CameraConfig, SourceKind};
use crate::storage::{RetentionPolicy, DEFAULT_ERROR_LOG_CAP};
use crate::ConfigRejected;

const DEFAULT_DB_PATH: &str = "headcount.db";
const DEFAULT_MAX_DB_MB: u64 = 200;
const DEFAULT_CAMERA_SOURCE: &str = "0";
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_RATE_HZ: f32 = 5.0;
const DEFAULT_PERSON_CLASS_ID: u32 = 0;

#[derive(Debug, Deserialize, Default)]
struct HeadcountConfigFile {
    db_path: Option<String>,
    store: Option<StoreConfigFile>,
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    max_size_mb: Option<u64>,
    error_log_cap: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    resolution: Option<String>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    enabled: Option<bool>,
    rate_hz: Option<f32>,
    person_class_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HeadcountConfig {
    pub db_path: String,
    pub store: StoreSettings,
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_size_mb: u64,
    pub error_log_cap: u64,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub source: SourceKind,
    pub resolution: Resolution,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    pub enabled: bool,
    pub rate_hz: f32,
    pub person_class_id: u32,
}

impl HeadcountConfig {
    /// Defaults, then the file named by `HEADCOUNT_CONFIG` (JSON, or TOML when
    /// the path ends in `.toml`), then `HEADCOUNT_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = non_empty_env("HEADCOUNT_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file instead of `HEADCOUNT_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HeadcountConfigFile) -> Result<Self> {
        let store = file.store.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();

        let source = camera
            .source
            .as_deref()
            .unwrap_or(DEFAULT_CAMERA_SOURCE);
        let resolution = match camera.resolution.as_deref() {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("camera.resolution '{}'", raw))?,
            None => Resolution::default(),
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            store: StoreSettings {
                max_size_mb: store.max_size_mb.unwrap_or(DEFAULT_MAX_DB_MB),
                error_log_cap: store.error_log_cap.unwrap_or(DEFAULT_ERROR_LOG_CAP),
            },
            camera: CameraSettings {
                source: SourceKind::classify(source)
                    .with_context(|| format!("camera.source '{}'", source))?,
                resolution,
                jpeg_quality: camera.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            detection: DetectionSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detection.model_path,
                confidence: detection.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                enabled: detection.enabled.unwrap_or(true),
                rate_hz: detection.rate_hz.unwrap_or(DEFAULT_RATE_HZ),
                person_class_id: detection
                    .person_class_id
                    .unwrap_or(DEFAULT_PERSON_CLASS_ID),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("HEADCOUNT_DB_PATH") {
            self.db_path = path;
        }
        if let Some(source) = non_empty_env("HEADCOUNT_CAMERA_SOURCE") {
            self.camera.source = SourceKind::classify(&source)
                .with_context(|| format!("HEADCOUNT_CAMERA_SOURCE '{}'", source))?;
        }
        if let Some(resolution) = non_empty_env("HEADCOUNT_RESOLUTION") {
            self.camera.resolution = resolution
                .parse()
                .with_context(|| format!("HEADCOUNT_RESOLUTION '{}'", resolution))?;
        }
        if let Some(max_mb) = non_empty_env("HEADCOUNT_MAX_DB_MB") {
            self.store.max_size_mb = max_mb
                .parse()
                .map_err(|_| anyhow!("HEADCOUNT_MAX_DB_MB must be an integer number of megabytes"))?;
        }
        if let Some(confidence) = non_empty_env("HEADCOUNT_CONFIDENCE") {
            self.detection.confidence = confidence
                .parse()
                .map_err(|_| anyhow!("HEADCOUNT_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Some(backend) = non_empty_env("HEADCOUNT_DETECTOR") {
            self.detection.backend = backend;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detection.confidence) {
            return Err(ConfigRejected::new(format!(
                "detection.confidence must be within [0, 1], got {}",
                self.detection.confidence
            ))
            .into());
        }
        if self.store.max_size_mb == 0 {
            return Err(ConfigRejected::new("store.max_size_mb must be greater than zero").into());
        }
        if self.store.error_log_cap == 0 {
            return Err(
                ConfigRejected::new("store.error_log_cap must be greater than zero").into(),
            );
        }
        let rate_hz = self.detection.rate_hz;
        if !(rate_hz > 0.0 && rate_hz <= crate::feed::DETECT_MAX_HZ) {
            return Err(ConfigRejected::new(format!(
                "detection.rate_hz must be within (0, {}], got {}",
                crate::feed::DETECT_MAX_HZ,
                rate_hz
            ))
            .into());
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(ConfigRejected::new(format!(
                "camera.jpeg_quality must be within 1..=100, got {}",
                self.camera.jpeg_quality
            ))
            .into());
        }
        self.detection.backend = self.detection.backend.trim().to_lowercase();
        Ok(())
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            source: self.camera.source.clone(),
            resolution: self.camera.resolution,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            error_log_cap: self.store.error_log_cap,
            ..RetentionPolicy::with_max_megabytes(self.store.max_size_mb)
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<HeadcountConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
