use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::capture::FacingMode;
use crate::frame::{
    SamplerConfig, SamplingMode, DEFAULT_EXACT_HEIGHT, DEFAULT_EXACT_WIDTH, DEFAULT_JPEG_QUALITY,
    DEFAULT_MAX_DIMENSION,
};
use crate::recognize::http::{endpoint_url, HttpConfig};

const DEFAULT_CAMERA_DEVICE: &str = "stub://front_camera";
const DEFAULT_IDEAL_WIDTH: u32 = 1280;
const DEFAULT_IDEAL_HEIGHT: u32 = 720;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;
const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
const DEFAULT_RECOGNITION_PATH: &str = "/api/face-recognition";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_VIEWPORT_WIDTH: f64 = 640.0;
const DEFAULT_VIEWPORT_HEIGHT: f64 = 480.0;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    camera: Option<CameraConfigFile>,
    sampler: Option<SamplerConfigFile>,
    backend: Option<BackendConfigFile>,
    viewport: Option<ViewportConfigFile>,
    identities: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    facing: Option<FacingMode>,
    ideal_width: Option<u32>,
    ideal_height: Option<u32>,
    mirrored: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplerConfigFile {
    interval_ms: Option<u64>,
    mode: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    max_dimension: Option<u32>,
    jpeg_quality: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    base_url: Option<String>,
    path: Option<String>,
    timeout_ms: Option<u64>,
    demo: Option<bool>,
    fields: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ViewportConfigFile {
    width: Option<f64>,
    height: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub camera: CameraSettings,
    pub sampler: SamplerSettings,
    pub backend: BackendSettings,
    pub viewport: ViewportSettings,
    /// Identity token to display name.
    pub identities: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub mirrored: bool,
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub mode: SamplingMode,
    pub jpeg_quality: f32,
}

impl SamplerSettings {
    pub fn to_sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            mode: self.mode,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub base_url: String,
    pub path: String,
    pub timeout: Duration,
    /// Serve detections from the built-in mock instead of the HTTP backend.
    pub demo: bool,
    /// Extra request body fields (class or session identifiers).
    pub fields: BTreeMap<String, String>,
}

impl BackendSettings {
    pub fn to_http_config(&self) -> HttpConfig {
        HttpConfig {
            base_url: self.base_url.clone(),
            path: self.path.clone(),
            timeout: self.timeout,
            fields: self.fields.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ViewportSettings {
    pub width: f64,
    pub height: f64,
}

impl PipelineConfig {
    /// Load from `PRESENCE_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PRESENCE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults), then apply environment overrides.
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

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            device: camera_file
                .device
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            facing: camera_file.facing.unwrap_or_default(),
            ideal_width: camera_file.ideal_width.unwrap_or(DEFAULT_IDEAL_WIDTH),
            ideal_height: camera_file.ideal_height.unwrap_or(DEFAULT_IDEAL_HEIGHT),
            // Front-facing previews are mirrored unless told otherwise.
            mirrored: camera_file
                .mirrored
                .unwrap_or(camera_file.facing.unwrap_or_default() == FacingMode::User),
        };

        let sampler_file = file.sampler.unwrap_or_default();
        let mode = match sampler_file.mode.as_deref().map(str::trim) {
            None | Some("exact") => SamplingMode::Exact {
                width: sampler_file.width.unwrap_or(DEFAULT_EXACT_WIDTH),
                height: sampler_file.height.unwrap_or(DEFAULT_EXACT_HEIGHT),
            },
            Some("proportional") => SamplingMode::Proportional {
                max_dimension: sampler_file.max_dimension.unwrap_or(DEFAULT_MAX_DIMENSION),
            },
            Some(other) => {
                return Err(anyhow!(
                    "unknown sampler mode '{}'; expected exact or proportional",
                    other
                ))
            }
        };
        let sampler = SamplerSettings {
            interval: Duration::from_millis(
                sampler_file.interval_ms.unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
            ),
            mode,
            jpeg_quality: sampler_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let backend_file = file.backend.unwrap_or_default();
        let backend = BackendSettings {
            base_url: backend_file
                .base_url
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            path: backend_file
                .path
                .unwrap_or_else(|| DEFAULT_RECOGNITION_PATH.to_string()),
            timeout: Duration::from_millis(
                backend_file.timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            demo: backend_file.demo.unwrap_or(false),
            fields: backend_file.fields.unwrap_or_default(),
        };

        let viewport_file = file.viewport.unwrap_or_default();
        let viewport = ViewportSettings {
            width: viewport_file.width.unwrap_or(DEFAULT_VIEWPORT_WIDTH),
            height: viewport_file.height.unwrap_or(DEFAULT_VIEWPORT_HEIGHT),
        };

        Ok(Self {
            camera,
            sampler,
            backend,
            viewport,
            identities: file.identities.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("PRESENCE_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(url) = std::env::var("PRESENCE_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend.base_url = url;
            }
        }
        if let Ok(interval) = std::env::var("PRESENCE_SAMPLE_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("PRESENCE_SAMPLE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.sampler.interval = Duration::from_millis(ms);
        }
        if let Ok(timeout) = std::env::var("PRESENCE_REQUEST_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("PRESENCE_REQUEST_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.backend.timeout = Duration::from_millis(ms);
        }
        if let Ok(demo) = std::env::var("PRESENCE_DEMO") {
            self.backend.demo = parse_flag(&demo)
                .ok_or_else(|| anyhow!("PRESENCE_DEMO must be true/false or 1/0"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera.device = self.camera.device.trim().to_string();
        if self.camera.device.is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.camera.ideal_width == 0 || self.camera.ideal_height == 0 {
            return Err(anyhow!("camera ideal resolution must be greater than zero"));
        }
        if self.sampler.interval.is_zero() {
            return Err(anyhow!("sample interval must be greater than zero"));
        }
        match self.sampler.mode {
            SamplingMode::Exact { width, height } if width == 0 || height == 0 => {
                return Err(anyhow!("sampler width and height must be greater than zero"));
            }
            SamplingMode::Proportional { max_dimension: 0 } => {
                return Err(anyhow!("sampler max_dimension must be greater than zero"));
            }
            _ => {}
        }
        let quality = self.sampler.jpeg_quality;
        if !(quality > 0.0 && quality <= 1.0) {
            return Err(anyhow!("jpeg_quality must be in (0, 1], got {}", quality));
        }
        if self.backend.timeout.is_zero() {
            return Err(anyhow!("request timeout must be greater than zero"));
        }
        endpoint_url(&self.backend.base_url, &self.backend.path)
            .context("invalid backend configuration")?;
        if !(self.viewport.width >= 0.0 && self.viewport.height >= 0.0) {
            return Err(anyhow!("viewport dimensions must not be negative"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<PipelineConfig> {
        let file: PipelineConfigFile = toml::from_str(raw)?;
        let mut cfg = PipelineConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").expect("defaults");
        assert_eq!(cfg.camera.device, DEFAULT_CAMERA_DEVICE);
        assert!(cfg.camera.mirrored);
        assert_eq!(cfg.sampler.interval, Duration::from_millis(1000));
        assert_eq!(
            cfg.sampler.mode,
            SamplingMode::Exact {
                width: 1280,
                height: 740
            }
        );
        assert_eq!(cfg.backend.timeout, Duration::from_secs(10));
        assert!(!cfg.backend.demo);
    }

    #[test]
    fn proportional_mode_and_fields() {
        let cfg = parse(
            r#"
            [camera]
            facing = "environment"

            [sampler]
            mode = "proportional"
            max_dimension = 640
            jpeg_quality = 0.7

            [backend]
            base_url = "https://recognition.local"
            path = "face/uploadmany"

            [backend.fields]
            class_id = "cls-7"

            [identities]
            "693ea35da92dbf184b9c7790" = "Ahmad Fauzi"
            "#,
        )
        .expect("config");
        assert!(!cfg.camera.mirrored);
        assert_eq!(
            cfg.sampler.mode,
            SamplingMode::Proportional { max_dimension: 640 }
        );
        assert_eq!(cfg.backend.fields.get("class_id").map(String::as_str), Some("cls-7"));
        assert_eq!(cfg.identities.len(), 1);
        assert_eq!(cfg.backend.to_http_config().path, "face/uploadmany");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse("[sampler]\ninterval_ms = 0").is_err());
        assert!(parse("[sampler]\njpeg_quality = 0.0").is_err());
        assert!(parse("[sampler]\njpeg_quality = 1.5").is_err());
        assert!(parse("[sampler]\nmode = \"fisheye\"").is_err());
        assert!(parse("[sampler]\nmode = \"proportional\"\nmax_dimension = 0").is_err());
        assert!(parse("[backend]\ntimeout_ms = 0").is_err());
        assert!(parse("[backend]\nbase_url = \"ftp://nope\"").is_err());
        assert!(parse("[camera]\nideal_width = 0").is_err());
    }

    #[test]
    fn parses_flags() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
