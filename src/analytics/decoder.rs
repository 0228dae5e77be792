use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::Frame;
use crate::queue::FrameQueue;

use super::detector::{MotionAnalyzer, ObjectDetector};

/// Bound on blocking queue reads so stage loops observe shutdown promptly.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Object decode stage: resize to the model's dimensions, run the
/// detector, push the annotated frame to the return queue.
pub fn spawn_object_decoder(
    decode_queue: Arc<FrameQueue<Frame>>,
    return_queue: Arc<FrameQueue<Frame>>,
    detector: Arc<dyn ObjectDetector>,
    shutdown: Arc<AtomicBool>,
    camera: String,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        tracing::debug!(camera = %camera, "object decoder started");

        while !shutdown.load(Ordering::Relaxed) {
            let Some(frame) = decode_queue.pop_timeout(QUEUE_TIMEOUT) else {
                continue;
            };

            let mut resized = frame.resized(detector.model_width(), detector.model_height());
            match detector.detect(&resized) {
                Ok(objects) => resized.objects = objects,
                Err(e) => {
                    tracing::debug!(camera = %camera, error = %e, "detector error, treating as no detections");
                    resized.objects = Vec::new();
                }
            }

            if return_queue.push(resized) {
                tracing::trace!(camera = %camera, "object return queue full, dropped oldest");
            }
        }

        tracing::debug!(camera = %camera, "object decoder stopped");
    })
}

/// Motion decode stage: resize to the motion analyzer's dimensions and
/// hand off to the analyzer task.
pub fn spawn_motion_decoder(
    decode_queue: Arc<FrameQueue<Frame>>,
    analyzer_queue: Arc<FrameQueue<Frame>>,
    width: u32,
    height: u32,
    shutdown: Arc<AtomicBool>,
    camera: String,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        tracing::debug!(camera = %camera, "motion decoder started");

        while !shutdown.load(Ordering::Relaxed) {
            let Some(frame) = decode_queue.pop_timeout(QUEUE_TIMEOUT) else {
                continue;
            };

            if analyzer_queue.push(frame.resized(width, height)) {
                tracing::trace!(camera = %camera, "motion analyzer queue full, dropped oldest");
            }
        }

        tracing::debug!(camera = %camera, "motion decoder stopped");
    })
}

/// Motion analyzer stage: attach contours and push to the return queue.
pub fn spawn_motion_analyzer(
    analyzer_queue: Arc<FrameQueue<Frame>>,
    return_queue: Arc<FrameQueue<Frame>>,
    analyzer: Arc<dyn MotionAnalyzer>,
    shutdown: Arc<AtomicBool>,
    camera: String,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        tracing::debug!(camera = %camera, "motion analyzer started");

        while !shutdown.load(Ordering::Relaxed) {
            let Some(mut frame) = analyzer_queue.pop_timeout(QUEUE_TIMEOUT) else {
                continue;
            };

            match analyzer.analyze(&frame) {
                Ok(contours) => frame.motion_contours = Some(contours),
                Err(e) => {
                    tracing::debug!(camera = %camera, error = %e, "motion analysis error");
                    frame.motion_contours = Some(Default::default());
                }
            }

            if return_queue.push(frame) {
                tracing::trace!(camera = %camera, "motion return queue full, dropped oldest");
            }
        }

        tracing::debug!(camera = %camera, "motion analyzer stopped");
    })
}
