use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::queue::{FrameQueue, FrameReady};

/// Transport contract: something that produces decoded frames from a
/// network stream. `read` blocks until the next frame and returns None
/// once the stream ends or the source has been released.
pub trait FrameSource: Send + Sync {
    /// Called when capture starts, clearing the effect of a prior
    /// `release` so the source can be reused.
    fn reopen(&self) {}

    fn read(&self) -> Option<Frame>;

    /// Unblock any pending read and end the stream.
    fn release(&self);

    fn resolution(&self) -> (u32, u32);

    fn fps(&self) -> u32;
}

/// Runtime toggles for the two analysis paths. Readers use acquire
/// semantics, writers release; exactly one gate is set at startup.
pub struct ScanGates {
    objects: AtomicBool,
    motion: AtomicBool,
}

impl ScanGates {
    /// When motion triggers the detector we start scanning for motion
    /// only; otherwise objects are scanned from the first frame.
    pub fn new(trigger_detector: bool) -> Self {
        Self {
            objects: AtomicBool::new(!trigger_detector),
            motion: AtomicBool::new(trigger_detector),
        }
    }

    pub fn scan_for_objects(&self) -> bool {
        self.objects.load(Ordering::Acquire)
    }

    pub fn set_scan_for_objects(&self, enabled: bool) {
        self.objects.store(enabled, Ordering::Release);
    }

    pub fn scan_for_motion(&self) -> bool {
        self.motion.load(Ordering::Acquire)
    }

    pub fn set_scan_for_motion(&self, enabled: bool) {
        self.motion.store(enabled, Ordering::Release);
    }
}

/// Fans raw frames out into the decode queues at the configured intervals
/// and signals frame-ready to the supervisor on every captured frame.
pub struct CaptureGate {
    pub source: Arc<dyn FrameSource>,
    pub gates: Arc<ScanGates>,
    pub object_queue: Arc<FrameQueue<Frame>>,
    pub motion_queue: Option<Arc<FrameQueue<Frame>>>,
    pub object_interval: Duration,
    pub motion_interval: Duration,
    pub frame_ready: Arc<FrameReady>,
    pub shutdown: Arc<AtomicBool>,
    pub camera: String,
}

impl CaptureGate {
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn run(self) {
        tracing::debug!(camera = %self.camera, "capture started");
        self.source.reopen();

        let mut last_object: Option<Instant> = None;
        let mut last_motion: Option<Instant> = None;

        while !self.shutdown.load(Ordering::Relaxed) {
            let Some(frame) = self.source.read() else {
                break;
            };
            let now = Instant::now();

            if self.gates.scan_for_objects() && due(last_object, self.object_interval, now) {
                last_object = Some(now);
                if self.object_queue.push(frame.clone()) {
                    tracing::trace!(camera = %self.camera, "object decode queue full, dropped oldest");
                }
            }

            if let Some(motion_queue) = &self.motion_queue {
                if self.gates.scan_for_motion() && due(last_motion, self.motion_interval, now) {
                    last_motion = Some(now);
                    if motion_queue.push(frame.clone()) {
                        tracing::trace!(camera = %self.camera, "motion decode queue full, dropped oldest");
                    }
                }
            }

            self.frame_ready.signal();
        }

        tracing::debug!(camera = %self.camera, "capture stopped");
    }
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        Some(last) => now.duration_since(last) >= interval,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) struct ScriptedSource {
        frames: Mutex<Vec<Frame>>,
        pub released: AtomicBool,
    }

    impl ScriptedSource {
        pub(crate) fn new(count: usize) -> Self {
            let frames = (0..count).map(|_| Frame::new(4, 4, vec![0; 48])).collect();
            Self {
                frames: Mutex::new(frames),
                released: AtomicBool::new(false),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn reopen(&self) {
            self.released.store(false, Ordering::SeqCst);
        }

        fn read(&self) -> Option<Frame> {
            if self.released.load(Ordering::SeqCst) {
                return None;
            }
            self.frames.lock().unwrap().pop()
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn resolution(&self) -> (u32, u32) {
            (4, 4)
        }

        fn fps(&self) -> u32 {
            10
        }
    }

    #[test]
    fn gates_start_mutually_exclusive() {
        let gates = ScanGates::new(true);
        assert!(gates.scan_for_motion());
        assert!(!gates.scan_for_objects());

        let gates = ScanGates::new(false);
        assert!(!gates.scan_for_motion());
        assert!(gates.scan_for_objects());
    }

    #[tokio::test]
    async fn capture_fans_out_and_signals() {
        let source = Arc::new(ScriptedSource::new(3));
        let gates = Arc::new(ScanGates::new(false));
        let object_queue = Arc::new(FrameQueue::new(8));
        let (frame_ready, mut listener) = FrameReady::new();

        let gate = CaptureGate {
            source,
            gates,
            object_queue: Arc::clone(&object_queue),
            motion_queue: None,
            object_interval: Duration::ZERO,
            motion_interval: Duration::ZERO,
            frame_ready: Arc::new(frame_ready),
            shutdown: Arc::new(AtomicBool::new(false)),
            camera: "test".to_string(),
        };

        gate.spawn().await.unwrap();
        listener.wait_first_frame().await;
        assert_eq!(object_queue.len(), 3);
    }

    #[tokio::test]
    async fn closed_gate_suppresses_publication() {
        let source = Arc::new(ScriptedSource::new(3));
        let gates = Arc::new(ScanGates::new(true));
        let object_queue = Arc::new(FrameQueue::new(8));
        let motion_queue = Arc::new(FrameQueue::new(8));
        let (frame_ready, _listener) = FrameReady::new();

        let gate = CaptureGate {
            source,
            gates,
            object_queue: Arc::clone(&object_queue),
            motion_queue: Some(Arc::clone(&motion_queue)),
            object_interval: Duration::ZERO,
            motion_interval: Duration::ZERO,
            frame_ready: Arc::new(frame_ready),
            shutdown: Arc::new(AtomicBool::new(false)),
            camera: "test".to_string(),
        };

        gate.spawn().await.unwrap();
        assert_eq!(object_queue.len(), 0);
        assert_eq!(motion_queue.len(), 3);
    }

    #[tokio::test]
    async fn release_stops_capture() {
        let source = Arc::new(ScriptedSource::new(0));
        source.release();
        let gates = Arc::new(ScanGates::new(false));
        let (frame_ready, _listener) = FrameReady::new();

        let gate = CaptureGate {
            source: Arc::clone(&source) as Arc<dyn FrameSource>,
            gates,
            object_queue: Arc::new(FrameQueue::new(2)),
            motion_queue: None,
            object_interval: Duration::ZERO,
            motion_interval: Duration::ZERO,
            frame_ready: Arc::new(frame_ready),
            shutdown: Arc::new(AtomicBool::new(false)),
            camera: "test".to_string(),
        };

        // reopen() clears the release, then the empty script ends the stream
        gate.spawn().await.unwrap();
        assert!(!source.released.load(Ordering::SeqCst));
    }
}
