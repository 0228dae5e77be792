use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::frame::Point;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no object detection labels configured")]
    NoLabels,
    #[error("duplicate object label: {0}")]
    DuplicateLabel(String),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointConfig {
    pub x: i32,
    pub y: i32,
}

impl From<&PointConfig> for Point {
    fn from(p: &PointConfig) -> Self {
        Point::new(p.x, p.y)
    }
}

pub fn polygon_from_config(points: &[PointConfig]) -> Vec<Point> {
    points.iter().map(Point::from).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_retain_lookback() -> u64 {
    5
}

fn default_recorder_timeout() -> u64 {
    10
}

fn default_segment_duration() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    pub folder: PathBuf,
    pub segments_folder: PathBuf,
    /// Days to retain finished recordings. Defaults to 7 with an error log
    /// when unset.
    pub retain: Option<u32>,
    #[serde(default = "default_retain_lookback")]
    pub lookback: u64,
    #[serde(default = "default_recorder_timeout")]
    pub timeout: u64,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u64,
}

fn default_triggers_recording() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub coordinates: Vec<PointConfig>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_triggers_recording")]
    pub triggers_recording: bool,
    #[serde(default)]
    pub post_processor: Option<String>,
}

fn default_camera_width() -> u32 {
    1920
}

fn default_camera_height() -> u32 {
    1080
}

fn default_camera_fps() -> u32 {
    25
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: u32,
    #[serde(default)]
    pub mqtt_name: Option<String>,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub publish_image: bool,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl CameraConfig {
    pub fn mqtt_name(&self) -> &str {
        self.mqtt_name.as_deref().unwrap_or(&self.name)
    }

    /// Lowercase identifier used as the per-camera logger suffix.
    pub fn name_slug(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

fn default_label_confidence() -> f32 {
    0.8
}

fn default_size_min() -> f32 {
    0.0
}

fn default_size_max() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelConfig {
    pub label: String,
    #[serde(default = "default_label_confidence")]
    pub confidence: f32,
    #[serde(default = "default_size_min")]
    pub height_min: f32,
    #[serde(default = "default_size_max")]
    pub height_max: f32,
    #[serde(default = "default_size_min")]
    pub width_min: f32,
    #[serde(default = "default_size_max")]
    pub width_max: f32,
    #[serde(default = "default_triggers_recording")]
    pub triggers_recording: bool,
    #[serde(default)]
    pub post_processor: Option<String>,
    #[serde(default)]
    pub require_motion: bool,
    #[serde(default)]
    pub inside_any_zone: bool,
}

fn default_object_interval() -> f64 {
    1.0
}

fn default_detector_url() -> String {
    "http://127.0.0.1:8089/detect".to_string()
}

fn default_model_width() -> u32 {
    640
}

fn default_model_height() -> u32 {
    480
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectDetectionConfig {
    pub labels: Vec<LabelConfig>,
    #[serde(default = "default_object_interval")]
    pub interval: f64,
    #[serde(default)]
    pub log_all_objects: bool,
    #[serde(default = "default_detector_url")]
    pub detector_url: String,
    #[serde(default = "default_model_width")]
    pub model_width: u32,
    #[serde(default = "default_model_height")]
    pub model_height: u32,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_trigger_detector() -> bool {
    true
}

fn default_motion_timeout() -> bool {
    true
}

fn default_max_timeout() -> u64 {
    30
}

fn default_motion_area() -> u32 {
    1000
}

fn default_motion_frames() -> u32 {
    3
}

fn default_motion_interval() -> f64 {
    1.0
}

fn default_motion_dim() -> u32 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionDetectionConfig {
    /// Motion enables the object detector instead of the inverse.
    #[serde(default = "default_trigger_detector")]
    pub trigger_detector: bool,
    /// Allow detected motion to keep an event alive past its triggers.
    #[serde(default = "default_motion_timeout")]
    pub timeout: bool,
    /// Longest time in seconds motion alone may sustain an event.
    #[serde(default = "default_max_timeout")]
    pub max_timeout: u64,
    /// Minimum contour area in px² that counts as motion.
    #[serde(default = "default_motion_area")]
    pub area: u32,
    /// Consecutive frames above `area` before motion is reported.
    #[serde(default = "default_motion_frames")]
    pub frames: u32,
    #[serde(default = "default_motion_interval")]
    pub interval: f64,
    #[serde(default = "default_motion_dim")]
    pub width: u32,
    #[serde(default = "default_motion_dim")]
    pub height: u32,
    #[serde(default)]
    pub mask: Vec<Vec<PointConfig>>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl MotionDetectionConfig {
    /// Motion analysis runs when it can sustain events or gate the detector.
    pub fn enabled(&self) -> bool {
        self.timeout || self.trigger_detector
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub recorder: RecorderConfig,
    pub camera: CameraConfig,
    pub object_detection: ObjectDetectionConfig,
    pub motion_detection: MotionDetectionConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.name.is_empty() {
            return Err(ConfigError::Invalid("camera.name is empty".to_string()));
        }

        if self.object_detection.labels.is_empty() {
            return Err(ConfigError::NoLabels);
        }

        let mut seen = HashSet::new();
        for label in &self.object_detection.labels {
            if !seen.insert(label.label.as_str()) {
                return Err(ConfigError::DuplicateLabel(label.label.clone()));
            }
            if !(0.0..=1.0).contains(&label.confidence) {
                return Err(ConfigError::Invalid(format!(
                    "confidence for label {} outside [0, 1]",
                    label.label
                )));
            }
            if label.width_min > label.width_max || label.height_min > label.height_max {
                return Err(ConfigError::Invalid(format!(
                    "size bounds for label {} are inverted",
                    label.label
                )));
            }
        }

        if self.object_detection.interval <= 0.0 || self.motion_detection.interval <= 0.0 {
            return Err(ConfigError::Invalid(
                "detection intervals must be positive".to_string(),
            ));
        }

        if self.motion_detection.frames == 0 {
            return Err(ConfigError::Invalid(
                "motion_detection.frames must be at least 1".to_string(),
            ));
        }

        for zone in &self.camera.zones {
            if zone.coordinates.len() < 3 {
                return Err(ConfigError::Invalid(format!(
                    "zone {} needs at least 3 coordinates",
                    zone.name
                )));
            }
        }

        Ok(())
    }
}
