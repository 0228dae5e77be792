use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::ObjectDetectionConfig;
use crate::frame::{BoundingBox, DetectedObject, Frame, MotionContours};
use crate::overlay;

const DETECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Mutual exclusion between detector inference and the recorder's mux
/// start, which contend for the same compute bottleneck.
pub type DetectionLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("frame encode failed")]
    Encode,
}

/// Object analyzer contract. Implementations annotate a decoder-resized
/// frame; an error is treated as "no detections" by the caller.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedObject>, DetectorError>;
    fn model_width(&self) -> u32;
    fn model_height(&self) -> u32;
}

/// Motion analyzer contract, producing contours for a motion-resolution
/// frame.
pub trait MotionAnalyzer: Send + Sync {
    fn analyze(&self, frame: &Frame) -> Result<MotionContours, DetectorError>;
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    label: String,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    detections: Vec<WireDetection>,
}

/// Client for the object-detection batching server: posts the frame as
/// JPEG, receives detections in frame coordinates.
pub struct HttpObjectDetector {
    client: reqwest::blocking::Client,
    url: String,
    model_width: u32,
    model_height: u32,
    detection_lock: DetectionLock,
}

impl HttpObjectDetector {
    pub fn new(
        config: &ObjectDetectionConfig,
        detection_lock: DetectionLock,
    ) -> Result<Self, DetectorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DETECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: config.detector_url.clone(),
            model_width: config.model_width,
            model_height: config.model_height,
            detection_lock,
        })
    }
}

impl ObjectDetector for HttpObjectDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedObject>, DetectorError> {
        let jpeg = overlay::encode_jpeg(frame).ok_or(DetectorError::Encode)?;

        // Inference and recording mux must not run at the same time
        let _guard = self.detection_lock.blocking_lock();

        let response: DetectResponse = self
            .client
            .post(&self.url)
            .header("content-type", "image/jpeg")
            .body(jpeg)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response
            .detections
            .into_iter()
            .map(|d| {
                DetectedObject::new(
                    d.label,
                    d.confidence,
                    BoundingBox {
                        x1: d.x1,
                        y1: d.y1,
                        x2: d.x2,
                        y2: d.y2,
                    },
                )
            })
            .collect())
    }

    fn model_width(&self) -> u32 {
        self.model_width
    }

    fn model_height(&self) -> u32 {
        self.model_height
    }
}
