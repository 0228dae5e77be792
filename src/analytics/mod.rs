pub mod decoder;
pub mod detector;
pub mod motion;
pub mod object;
pub mod pipeline;
pub mod zones;

pub use detector::{DetectorError, HttpObjectDetector, MotionAnalyzer, ObjectDetector};
pub use motion::FrameDiffMotion;
pub use pipeline::{Supervisor, SupervisorHandle};

use tokio::sync::mpsc;

use crate::frame::{DetectedObject, Frame};

const POST_PROCESSOR_QUEUE_CAPACITY: usize = 16;

/// Work item for the external post-processor pool.
#[derive(Debug, Clone)]
pub struct PostProcessorItem {
    pub name: String,
    pub frame: Frame,
    pub object: DetectedObject,
}

/// Fire-and-forget dispatch into the post-processor pool's work queue.
/// Errors in the pool never propagate back; a full queue drops the item.
#[derive(Clone)]
pub struct PostProcessorDispatch {
    tx: mpsc::Sender<PostProcessorItem>,
}

impl PostProcessorDispatch {
    pub fn channel() -> (Self, mpsc::Receiver<PostProcessorItem>) {
        let (tx, rx) = mpsc::channel(POST_PROCESSOR_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn dispatch(&self, name: &str, frame: &Frame, object: &DetectedObject) {
        let item = PostProcessorItem {
            name: name.to_string(),
            frame: frame.clone(),
            object: object.clone(),
        };
        if self.tx.try_send(item).is_err() {
            tracing::debug!(post_processor = %name, "post processor queue full, dropping item");
        }
    }
}
