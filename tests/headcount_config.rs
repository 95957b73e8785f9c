use std::sync::Mutex;

use tempfile::NamedTempFile;

use headcount::config::HeadcountConfig;
use headcount::{ConfigRejected, Resolution, SourceKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "HEADCOUNT_CONFIG",
        "HEADCOUNT_DB_PATH",
        "HEADCOUNT_CAMERA_SOURCE",
        "HEADCOUNT_RESOLUTION",
        "HEADCOUNT_MAX_DB_MB",
        "HEADCOUNT_CONFIDENCE",
        "HEADCOUNT_DETECTOR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "people.db",
        "store": { "max_size_mb": 50, "error_log_cap": 200 },
        "camera": {
            "source": "http://10.0.0.5/stream.mjpg",
            "resolution": "1280x720",
            "jpeg_quality": 75
        },
        "detection": {
            "backend": "Stub",
            "confidence": 0.4,
            "enabled": false,
            "rate_hz": 2.0
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("HEADCOUNT_CONFIG", file.path());
    std::env::set_var("HEADCOUNT_CAMERA_SOURCE", "picamera");
    std::env::set_var("HEADCOUNT_CONFIDENCE", "0.7");

    let cfg = HeadcountConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "people.db");
    assert_eq!(cfg.store.max_size_mb, 50);
    assert_eq!(cfg.retention_policy().max_bytes, 50 * 1024 * 1024);
    assert_eq!(cfg.retention_policy().error_log_cap, 200);
    assert_eq!(cfg.camera.source, SourceKind::BoardCamera);
    assert_eq!(cfg.camera.resolution, Resolution::new(1280, 720));
    assert_eq!(cfg.camera.jpeg_quality, 75);
    assert_eq!(cfg.detection.backend, "stub");
    assert!(!cfg.detection.enabled);
    assert!((cfg.detection.confidence - 0.7).abs() < 1e-6);
    assert!((cfg.detection.rate_hz - 2.0).abs() < 1e-6);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
db_path = "counts.db"

[camera]
source = "2"
resolution = "320x240"

[detection]
person_class_id = 1
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = HeadcountConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.db_path, "counts.db");
    assert_eq!(cfg.camera.source, SourceKind::LocalDevice(2));
    assert_eq!(cfg.camera_config().resolution, Resolution::new(320, 240));
    assert_eq!(cfg.detection.person_class_id, 1);
    assert_eq!(cfg.detection.backend, "stub");

    clear_env();
}

#[test]
fn invalid_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("HEADCOUNT_RESOLUTION", "640-480");
    let err = HeadcountConfig::load().expect_err("bad resolution");
    assert!(err.downcast_ref::<ConfigRejected>().is_some());
    clear_env();

    std::env::set_var("HEADCOUNT_CONFIDENCE", "1.5");
    let err = HeadcountConfig::load().expect_err("confidence out of range");
    assert!(err.to_string().contains("detection.confidence"));
    clear_env();

    std::env::set_var("HEADCOUNT_CAMERA_SOURCE", "ftp://camera/stream");
    assert!(HeadcountConfig::load().is_err());
    clear_env();
}
