use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use presence_pipeline::config::PipelineConfig;
use presence_pipeline::{FacingMode, SamplingMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_CONFIG",
        "PRESENCE_CAMERA_DEVICE",
        "PRESENCE_BACKEND_URL",
        "PRESENCE_SAMPLE_INTERVAL_MS",
        "PRESENCE_REQUEST_TIMEOUT_MS",
        "PRESENCE_DEMO",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let raw = r#"
        [camera]
        device = "stub://lobby"
        facing = "environment"
        ideal_width = 1920
        ideal_height = 1080

        [sampler]
        interval_ms = 500
        mode = "proportional"
        max_dimension = 800
        jpeg_quality = 0.9

        [backend]
        base_url = "http://recognition.internal:8000"
        path = "/face/uploadmany"
        timeout_ms = 4000

        [backend.fields]
        class_id = "6942cd4ac9fd8aa1f7a6d2a3"

        [viewport]
        width = 1280.0
        height = 720.0

        [identities]
        "693ea35da92dbf184b9c7790" = "Ahmad Fauzi"
        "694a6032380de32ee408ff30" = "Siti Rahma"
    "#;
    std::io::Write::write_all(&mut file, raw.as_bytes()).expect("write config");

    std::env::set_var("PRESENCE_CONFIG", file.path());
    std::env::set_var("PRESENCE_BACKEND_URL", "https://recognition.example");
    std::env::set_var("PRESENCE_SAMPLE_INTERVAL_MS", "750");
    std::env::set_var("PRESENCE_DEMO", "true");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.camera.device, "stub://lobby");
    assert_eq!(cfg.camera.facing, FacingMode::Environment);
    assert!(!cfg.camera.mirrored);
    assert_eq!((cfg.camera.ideal_width, cfg.camera.ideal_height), (1920, 1080));
    assert_eq!(cfg.sampler.interval, Duration::from_millis(750));
    assert_eq!(cfg.sampler.mode, SamplingMode::Proportional { max_dimension: 800 });
    assert!((cfg.sampler.jpeg_quality - 0.9).abs() < f32::EPSILON);
    assert_eq!(cfg.backend.base_url, "https://recognition.example");
    assert_eq!(cfg.backend.path, "/face/uploadmany");
    assert_eq!(cfg.backend.timeout, Duration::from_secs(4));
    assert!(cfg.backend.demo);
    assert_eq!(
        cfg.backend.fields.get("class_id").map(String::as_str),
        Some("6942cd4ac9fd8aa1f7a6d2a3")
    );
    assert_eq!((cfg.viewport.width, cfg.viewport.height), (1280.0, 720.0));
    assert_eq!(cfg.identities.len(), 2);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.device, "stub://front_camera");
    assert_eq!(
        cfg.sampler.mode,
        SamplingMode::Exact {
            width: 1280,
            height: 740
        }
    );
    assert_eq!(cfg.sampler.interval, Duration::from_millis(1000));
    assert_eq!(cfg.backend.timeout, Duration::from_secs(10));
    assert!(cfg.identities.is_empty());
}

#[test]
fn json_config_files_are_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp config");
    let raw = r#"{ "sampler": { "mode": "exact", "width": 640, "height": 370 } }"#;
    std::io::Write::write_all(&mut file, raw.as_bytes()).expect("write config");

    let cfg = PipelineConfig::load_from(Some(file.path())).expect("load json config");
    assert_eq!(
        cfg.sampler.mode,
        SamplingMode::Exact {
            width: 640,
            height: 370
        }
    );
}

#[test]
fn rejects_malformed_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_SAMPLE_INTERVAL_MS", "soon");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("PRESENCE_REQUEST_TIMEOUT_MS", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("PRESENCE_BACKEND_URL", "localhost:8000");
    let err = PipelineConfig::load().expect_err("scheme-less url");
    assert!(format!("{:#}", err).contains("backend"));
    clear_env();

    std::env::set_var("PRESENCE_DEMO", "sometimes");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}
