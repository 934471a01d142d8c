//! Runtime settings: built-in defaults, then an optional TOML file, then
//! `FACEWATCH_*` environment variables. Built once at startup and handed to
//! each component by reference.

use crate::batch::EventMode;
use crate::extractor::{ExtractorOptions, TensorLayout, FACENET_INPUT_SIZE};
use crate::gallery::DEFAULT_THRESHOLD;
use crate::onnx::DevicePreference;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "facewatch.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub accelerator: AcceleratorConfig,
    pub detector: DetectorConfig,
    pub gallery: GalleryConfig,
    pub batch: BatchConfig,
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub device: DevicePreference,
    /// Path to the embedding graph (ONNX).
    pub graph: PathBuf,
    pub intra_threads: usize,
    pub input_size: u32,
    pub layout: TensorLayout,
    pub embedding_dim: Option<usize>,
    /// Inference calls slower than this are logged as warnings.
    pub slow_infer_ms: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            graph: PathBuf::from("model/facenet.onnx"),
            intra_threads: 2,
            input_size: FACENET_INPUT_SIZE,
            layout: TensorLayout::Nhwc,
            embedding_dim: None,
            slow_infer_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Path to the SCRFD detection model.
    pub model: PathBuf,
    pub confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("model/det_10g.onnx"),
            confidence: crate::detector::DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// Directory of known-identity reference photos.
    pub dir: PathBuf,
    /// Euclidean distance threshold for a positive match.
    pub threshold: f32,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("model/data/known"),
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub test_dir: PathBuf,
    pub events: EventMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("model/data/testing"),
            events: EventMode::PerComparison,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera identifier reported as the origin of every alert.
    pub id: String,
    /// V4L2 device path or `http(s)://` MJPEG URL.
    pub source: String,
    /// Pixels added around each detection before cropping.
    pub margin: u32,
    /// Flip the streamed frame horizontally.
    pub mirror: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: "camera-0".into(),
            source: "/dev/video0".into(),
            margin: 100,
            mirror: true,
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub bind: String,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// URL alerts are POSTed to; alerts are only logged when unset.
    pub webhook: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            webhook: None,
            timeout_ms: 2000,
        }
    }
}

impl Settings {
    /// Load settings from `path` (or `facewatch.toml` when present), then
    /// apply environment overrides and validate.
    ///
    /// An explicitly requested file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACEWATCH_*` overrides from `lookup`. Unparseable values keep
    /// the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEWATCH_DEVICE") {
            self.accelerator.device = parse_or(&v, "FACEWATCH_DEVICE", self.accelerator.device);
        }
        if let Some(v) = lookup("FACEWATCH_GRAPH") {
            self.accelerator.graph = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_DETECTOR_MODEL") {
            self.detector.model = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_GALLERY_DIR") {
            self.gallery.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_THRESHOLD") {
            self.gallery.threshold = parse_or(&v, "FACEWATCH_THRESHOLD", self.gallery.threshold);
        }
        if let Some(v) = lookup("FACEWATCH_TEST_DIR") {
            self.batch.test_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_CAMERA_ID") {
            self.camera.id = v;
        }
        if let Some(v) = lookup("FACEWATCH_CAMERA_SOURCE") {
            self.camera.source = v;
        }
        if let Some(v) = lookup("FACEWATCH_STREAM_BIND") {
            self.stream.bind = v;
        }
        if let Some(v) = lookup("FACEWATCH_WEBHOOK") {
            self.events.webhook = if v.is_empty() { None } else { Some(v) };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.gallery.threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gallery.threshold must be a positive number, got {threshold}"
            )));
        }
        if self.accelerator.input_size == 0 {
            return Err(ConfigError::Invalid("accelerator.input_size must be > 0".into()));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "stream.jpeg_quality must be 1..=100, got {}",
                self.stream.jpeg_quality
            )));
        }
        if self.camera.id.trim().is_empty() {
            return Err(ConfigError::Invalid("camera.id must not be empty".into()));
        }
        Ok(())
    }

    pub fn slow_infer(&self) -> Duration {
        Duration::from_millis(self.accelerator.slow_infer_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.events.timeout_ms)
    }

    pub fn extractor_options(&self) -> ExtractorOptions {
        ExtractorOptions {
            input_size: self.accelerator.input_size,
            layout: self.accelerator.layout,
            embedding_dim: self.accelerator.embedding_dim,
        }
    }
}

fn parse_or<T: FromStr>(value: &str, key: &str, current: T) -> T {
    match value.parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable environment override");
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.camera.margin, 100);
        assert_eq!(settings.accelerator.input_size, 160);
        assert_eq!(settings.batch.events, EventMode::PerComparison);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [gallery]
            threshold = 0.9

            [camera]
            id = "front-door"
            source = "http://10.0.0.5/video.mjpg"

            [batch]
            events = "verdict"

            [accelerator]
            device = "cpu"
            layout = "nchw"
            "#,
        )
        .unwrap();
        assert_eq!(settings.gallery.threshold, 0.9);
        assert_eq!(settings.gallery.dir, GalleryConfig::default().dir);
        assert_eq!(settings.camera.id, "front-door");
        assert_eq!(settings.camera.margin, 100);
        assert_eq!(settings.batch.events, EventMode::Verdict);
        assert_eq!(settings.accelerator.device, DevicePreference::Cpu);
        assert_eq!(settings.accelerator.layout, TensorLayout::Nchw);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACEWATCH_THRESHOLD", "0.75"),
            ("FACEWATCH_CAMERA_ID", "lobby"),
            ("FACEWATCH_DEVICE", "cuda"),
            ("FACEWATCH_WEBHOOK", "http://alerts.local/in"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.gallery.threshold, 0.75);
        assert_eq!(settings.camera.id, "lobby");
        assert_eq!(settings.accelerator.device, DevicePreference::Cuda);
        assert_eq!(settings.events.webhook.as_deref(), Some("http://alerts.local/in"));
    }

    #[test]
    fn test_unparseable_env_keeps_value() {
        let mut settings = Settings::default();
        settings.apply_overrides(|k| (k == "FACEWATCH_THRESHOLD").then(|| "lots".to_string()));
        assert_eq!(settings.gallery.threshold, DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut settings = Settings::default();
        settings.gallery.threshold = 0.0;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
        settings.gallery.threshold = f32::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quality() {
        let mut settings = Settings::default();
        settings.stream.jpeg_quality = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let err = Settings::load(Some(Path::new("/nonexistent/facewatch.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[gallery\nthreshold = ").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(ConfigError::Parse { .. })));
    }
}
