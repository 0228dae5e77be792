use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::broker::{BinarySensor, CameraImage, Publisher, StatusSensor, StatusState};
use crate::camera::capture::{CaptureGate, FrameSource, ScanGates};
use crate::config::Config;
use crate::frame::{DetectedObject, Frame, Point, Polygon};
use crate::overlay::{self, OverlaySpec};
use crate::queue::{FrameQueue, FrameReady, FrameReadyListener};
use crate::recorder::Recorder;

use super::decoder;
use super::detector::{MotionAnalyzer, ObjectDetector};
use super::motion::MotionFilter;
use super::object::ObjectFilter;
use super::zones::Zone;
use super::PostProcessorDispatch;

const QUEUE_CAPACITY: usize = 2;
/// Loop wake-up bound so shutdown stays responsive without frames.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);
const COMMAND_QUEUE_CAPACITY: usize = 8;

/// Event bookkeeping between the first trigger frame and the recording
/// stop. `motion_only_frames` only grows while motion alone sustains the
/// event; `idle_frames` only grows while the event is over but the
/// recorder still runs.
#[derive(Debug, Default)]
struct EventState {
    motion_only_frames: u32,
    motion_max_timeout_reached: bool,
    idle_frames: u32,
    trigger_recorder: bool,
    start_recorder_edge: bool,
}

enum Wake {
    Frame(bool),
    Command(Option<String>),
}

/// Control handle for a running supervisor: camera on/off commands from
/// the broker's switch topic, plus shutdown.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<String>,
    shutdown: Arc<AtomicBool>,
}

impl SupervisorHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub async fn send_command(&self, payload: impl Into<String>) {
        let _ = self.commands.send(payload.into()).await;
    }
}

/// The per-camera event state machine. Paced by the frame-ready signal,
/// it fuses both analyzer paths, toggles the scan gates and drives the
/// recorder.
pub struct Supervisor {
    config: Arc<Config>,
    slug: String,
    fps: u32,

    source: Arc<dyn FrameSource>,
    detector: Arc<dyn ObjectDetector>,
    motion_analyzer: Option<Arc<dyn MotionAnalyzer>>,
    gates: Arc<ScanGates>,
    shutdown: Arc<AtomicBool>,

    object_decode_queue: Arc<FrameQueue<Frame>>,
    motion_decode_queue: Arc<FrameQueue<Frame>>,
    analyzer_queue: Arc<FrameQueue<Frame>>,
    object_return_queue: Arc<FrameQueue<Frame>>,
    motion_return_queue: Arc<FrameQueue<Frame>>,
    frame_ready: Arc<FrameReady>,
    frame_listener: FrameReadyListener,

    commands: mpsc::Receiver<String>,
    commands_open: bool,
    capture_task: Option<tokio::task::JoinHandle<()>>,
    stage_tasks: Vec<tokio::task::JoinHandle<()>>,

    object_filters: HashMap<String, ObjectFilter>,
    zone_polygons: Vec<Polygon>,
    zones: Vec<Zone>,
    overlay_mask: Vec<Polygon>,
    motion_filter: MotionFilter,
    event: EventState,
    recorder: Recorder,

    objects_in_fov: Vec<DetectedObject>,
    label_counts: HashMap<String, usize>,
    label_sensors: HashMap<String, BinarySensor>,
    object_sensor: BinarySensor,
    motion_sensor: BinarySensor,
    status_sensor: StatusSensor,
    camera_image: CameraImage,
    post_processors: PostProcessorDispatch,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        source: Arc<dyn FrameSource>,
        detector: Arc<dyn ObjectDetector>,
        motion_analyzer: Option<Arc<dyn MotionAnalyzer>>,
        recorder: Recorder,
        publisher: Publisher,
        post_processors: PostProcessorDispatch,
        shutdown: Arc<AtomicBool>,
    ) -> (Self, SupervisorHandle) {
        let slug = config.camera.name_slug();
        let mqtt_name = config.camera.mqtt_name().to_string();
        let fps = source.fps().max(1);

        let gates = Arc::new(ScanGates::new(config.motion_detection.trigger_detector));
        let (frame_ready, frame_listener) = FrameReady::new();
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        // Geometry is configured in camera coordinates; the object path
        // works in model coordinates.
        let (cam_w, cam_h) = source.resolution();
        let sx = detector.model_width() as f32 / cam_w.max(1) as f32;
        let sy = detector.model_height() as f32 / cam_h.max(1) as f32;

        let zones: Vec<Zone> = config
            .camera
            .zones
            .iter()
            .map(|zone_config| {
                let mut scaled = zone_config.clone();
                for point in &mut scaled.coordinates {
                    point.x = (point.x as f32 * sx) as i32;
                    point.y = (point.y as f32 * sy) as i32;
                }
                Zone::new(&scaled, publisher.clone(), &mqtt_name)
            })
            .collect();
        let zone_polygons = zones.iter().map(|z| z.polygon().clone()).collect();

        let overlay_mask = config
            .motion_detection
            .mask
            .iter()
            .map(|polygon| {
                polygon
                    .iter()
                    .map(|p| Point::new((p.x as f32 * sx) as i32, (p.y as f32 * sy) as i32))
                    .collect()
            })
            .collect();

        let object_filters = config
            .object_detection
            .labels
            .iter()
            .map(|label| (label.label.clone(), ObjectFilter::new(label)))
            .collect();

        let label_sensors = config
            .object_detection
            .labels
            .iter()
            .map(|label| {
                let sensor = BinarySensor::new(
                    publisher.clone(),
                    &mqtt_name,
                    &format!("object_detected {}", label.label),
                );
                (label.label.clone(), sensor)
            })
            .collect();

        let motion_filter = MotionFilter::new(&config.motion_detection);

        let handle = SupervisorHandle {
            commands: command_tx,
            shutdown: Arc::clone(&shutdown),
        };

        let supervisor = Self {
            slug,
            fps,
            source,
            detector,
            motion_analyzer,
            gates,
            shutdown,
            object_decode_queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY)),
            motion_decode_queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY)),
            analyzer_queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY)),
            object_return_queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY)),
            motion_return_queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY)),
            frame_ready: Arc::new(frame_ready),
            frame_listener,
            commands,
            commands_open: true,
            capture_task: None,
            stage_tasks: Vec::new(),
            object_filters,
            zone_polygons,
            zones,
            overlay_mask,
            motion_filter,
            event: EventState::default(),
            recorder,
            objects_in_fov: Vec::new(),
            label_counts: HashMap::new(),
            label_sensors,
            object_sensor: BinarySensor::new(publisher.clone(), &mqtt_name, "object_detected"),
            motion_sensor: BinarySensor::new(publisher.clone(), &mqtt_name, "motion_detected"),
            status_sensor: StatusSensor::new(publisher.clone(), &mqtt_name),
            camera_image: CameraImage::new(publisher, &mqtt_name),
            post_processors,
            config,
        };

        (supervisor, handle)
    }

    pub async fn run(mut self) {
        tracing::debug!(camera = %self.slug, "starting nvr pipeline");
        self.spawn_stages();
        self.start_camera();

        tracing::debug!(camera = %self.slug, "waiting for first frame");
        while !self.shutdown.load(Ordering::Acquire) {
            if self.frame_listener.wait(LOOP_TIMEOUT).await {
                tracing::debug!(camera = %self.slug, "first frame received");
                break;
            }
        }

        while !self.shutdown.load(Ordering::Acquire) {
            self.update_status();

            let wake = if self.commands_open {
                let listener = &mut self.frame_listener;
                let commands = &mut self.commands;
                tokio::select! {
                    ready = listener.wait(LOOP_TIMEOUT) => Wake::Frame(ready),
                    command = commands.recv() => Wake::Command(command),
                }
            } else {
                Wake::Frame(self.frame_listener.wait(LOOP_TIMEOUT).await)
            };

            match wake {
                Wake::Command(Some(payload)) => {
                    self.toggle_camera(&payload).await;
                    continue;
                }
                Wake::Command(None) => {
                    self.commands_open = false;
                    continue;
                }
                Wake::Frame(false) => continue,
                Wake::Frame(true) => {}
            }

            self.tick();
        }

        self.shutdown_pipeline().await;
    }

    /// One supervisor iteration: drain at most one frame per path, fuse
    /// the analyzer results and drive the recorder edge.
    fn tick(&mut self) {
        let mut object_frame = self.object_return_queue.try_pop();
        if let Some(frame) = object_frame.as_mut() {
            self.filter_fov(frame);
            self.filter_zones(frame);
        }

        let motion_frame = self.motion_return_queue.try_pop();
        if let Some(frame) = &motion_frame {
            if let Some(contours) = &frame.motion_contours {
                self.filter_motion(contours);
            }
        }

        self.process_object_event();
        self.process_motion_event();

        if (object_frame.is_some() || motion_frame.is_some()) && self.config.camera.publish_image {
            self.publish_image(object_frame.as_ref(), motion_frame.as_ref());
        }

        if self.event.start_recorder_edge {
            self.event.start_recorder_edge = false;
            self.start_recording(object_frame.as_ref());
        } else if self.recorder.is_recording() && self.event_over() {
            self.event.idle_frames += 1;
            self.stop_recording();
            return;
        }

        self.event.idle_frames = 0;
    }

    fn spawn_stages(&mut self) {
        self.stage_tasks.push(decoder::spawn_object_decoder(
            Arc::clone(&self.object_decode_queue),
            Arc::clone(&self.object_return_queue),
            Arc::clone(&self.detector),
            Arc::clone(&self.shutdown),
            self.slug.clone(),
        ));

        if let Some(analyzer) = self.motion_analyzer.clone() {
            self.stage_tasks.push(decoder::spawn_motion_decoder(
                Arc::clone(&self.motion_decode_queue),
                Arc::clone(&self.analyzer_queue),
                self.config.motion_detection.width,
                self.config.motion_detection.height,
                Arc::clone(&self.shutdown),
                self.slug.clone(),
            ));
            self.stage_tasks.push(decoder::spawn_motion_analyzer(
                Arc::clone(&self.analyzer_queue),
                Arc::clone(&self.motion_return_queue),
                analyzer,
                Arc::clone(&self.shutdown),
                self.slug.clone(),
            ));
        }
    }

    fn start_camera(&mut self) {
        let alive = self
            .capture_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if alive {
            return;
        }

        tracing::debug!(camera = %self.slug, "starting camera");
        let motion_queue = self
            .config
            .motion_detection
            .enabled()
            .then(|| Arc::clone(&self.motion_decode_queue));

        let gate = CaptureGate {
            source: Arc::clone(&self.source),
            gates: Arc::clone(&self.gates),
            object_queue: Arc::clone(&self.object_decode_queue),
            motion_queue,
            object_interval: Duration::from_secs_f64(self.config.object_detection.interval),
            motion_interval: Duration::from_secs_f64(self.config.motion_detection.interval),
            frame_ready: Arc::clone(&self.frame_ready),
            shutdown: Arc::clone(&self.shutdown),
            camera: self.slug.clone(),
        };
        self.capture_task = Some(gate.spawn());
    }

    async fn stop_camera(&mut self) {
        tracing::debug!(camera = %self.slug, "stopping camera");
        self.source.release();
        if let Some(task) = self.capture_task.take() {
            let _ = task.await;
        }
        if self.recorder.is_recording() {
            self.recorder.stop();
        }
    }

    async fn toggle_camera(&mut self, payload: &str) {
        match payload {
            "ON" => self.start_camera(),
            "OFF" => self.stop_camera().await,
            _ => {}
        }
    }

    fn update_status(&mut self) {
        let state = if self.recorder.is_recording() {
            StatusState::Recording
        } else if self.gates.scan_for_objects() {
            StatusState::ScanningForObjects
        } else if self.gates.scan_for_motion() {
            StatusState::ScanningForMotion
        } else {
            StatusState::Unknown
        };

        let attributes = json!({
            "last_recording_start": self.recorder.last_recording_start().map(|t| t.to_rfc3339()),
            "last_recording_end": self.recorder.last_recording_end().map(|t| t.to_rfc3339()),
        });
        self.status_sensor.publish(state, attributes);
    }

    /// Mark relevant objects, set the recorder trigger and dispatch
    /// post-processors for this object frame.
    fn filter_fov(&mut self, frame: &mut Frame) {
        self.event.trigger_recorder = false;
        let motion_detected = self.motion_filter.detected();

        let mut objects_in_fov = Vec::new();
        let mut labels = Vec::new();
        let mut dispatches = Vec::new();

        for object in frame.objects.iter_mut() {
            let Some(filter) = self.object_filters.get(&object.label) else {
                continue;
            };
            if !filter.matches(object, frame.width, frame.height, &self.zone_polygons) {
                continue;
            }
            object.relevant = true;

            if filter.triggers_recording && (!filter.require_motion || motion_detected) {
                self.event.trigger_recorder = true;
            }
            if let Some(post_processor) = &filter.post_processor {
                dispatches.push((post_processor.clone(), object.clone()));
            }

            labels.push(object.label.clone());
            objects_in_fov.push(object.clone());
        }

        for (name, object) in dispatches {
            self.post_processors.dispatch(&name, frame, &object);
        }

        if self.config.object_detection.log_all_objects {
            let all: Vec<_> = frame.objects.iter().map(|o| o.formatted()).collect();
            tracing::debug!(camera = %self.slug, objects = ?all, "all objects");
        } else {
            let in_fov: Vec<_> = objects_in_fov.iter().map(|o| o.formatted()).collect();
            tracing::debug!(camera = %self.slug, objects = ?in_fov, "objects in fov");
        }

        self.set_objects_in_fov(objects_in_fov);
        self.report_labels(&labels);
    }

    /// Publish the object set when it changed, compared as a list ordered
    /// by label then confidence.
    fn set_objects_in_fov(&mut self, mut objects: Vec<DetectedObject>) {
        objects.sort_by(|a, b| {
            a.label.cmp(&b.label).then(
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        if objects == self.objects_in_fov {
            return;
        }

        let attributes = json!({
            "objects": objects.iter().map(|o| o.formatted()).collect::<Vec<_>>(),
        });
        self.object_sensor.publish(!objects.is_empty(), attributes);
        self.objects_in_fov = objects;
    }

    /// Per-label presence topics, published only when presence flips.
    fn report_labels(&mut self, labels: &[String]) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for label in labels {
            *counts.entry(label.as_str()).or_default() += 1;
        }

        for (label, sensor) in &mut self.label_sensors {
            let count = counts.get(label.as_str()).copied().unwrap_or(0);
            let previous = self.label_counts.insert(label.clone(), count).unwrap_or(0);
            if (count > 0) != (previous > 0) {
                sensor.publish(count > 0, json!({ "count": count }));
            }
        }
    }

    fn filter_zones(&mut self, frame: &Frame) {
        for zone in &mut self.zones {
            for (name, object) in zone.evaluate(frame) {
                self.post_processors.dispatch(&name, frame, &object);
            }
        }
    }

    fn filter_motion(&mut self, contours: &crate::frame::MotionContours) {
        if let Some(detected) = self.motion_filter.process(contours) {
            tracing::debug!(
                camera = %self.slug,
                detected,
                "motion detected state changed"
            );
            self.motion_sensor.publish(detected, json!({}));
        }
    }

    fn process_object_event(&mut self) {
        let triggered =
            self.event.trigger_recorder || self.zones.iter().any(|z| z.triggers_recorder());
        if triggered && !self.recorder.is_recording() {
            self.event.start_recorder_edge = true;
        }
    }

    fn process_motion_event(&mut self) {
        if self.motion_filter.detected() {
            if self.config.motion_detection.trigger_detector && !self.gates.scan_for_objects() {
                self.gates.set_scan_for_objects(true);
                tracing::debug!(camera = %self.slug, "starting object detector");
            }
        } else if self.gates.scan_for_objects()
            && !self.recorder.is_recording()
            && self.config.motion_detection.trigger_detector
        {
            tracing::debug!(camera = %self.slug, "not recording, pausing object detector");
            self.gates.set_scan_for_objects(false);
        }
    }

    /// An event is over once neither objects, zones nor (time-bounded)
    /// motion sustain it.
    fn event_over(&mut self) -> bool {
        if self.event.trigger_recorder || self.zones.iter().any(|z| z.triggers_recorder()) {
            self.event.motion_max_timeout_reached = false;
            self.event.motion_only_frames = 0;
            return false;
        }

        if self.config.motion_detection.timeout && self.motion_filter.detected() {
            let limit = self.fps * self.config.motion_detection.max_timeout as u32;
            if self.event.motion_only_frames >= limit {
                if !self.event.motion_max_timeout_reached {
                    self.event.motion_max_timeout_reached = true;
                    tracing::debug!(
                        camera = %self.slug,
                        "motion has stalled the recorder past max_timeout, event considered over"
                    );
                }
                return true;
            }
            self.event.motion_only_frames += 1;
            return false;
        }

        true
    }

    fn start_recording(&mut self, frame: Option<&Frame>) {
        self.recorder
            .start(frame, self.objects_in_fov.clone(), self.source.resolution());

        if self.config.motion_detection.timeout && !self.gates.scan_for_motion() {
            self.gates.set_scan_for_motion(true);
            tracing::info!(camera = %self.slug, "starting motion detector");
        }
    }

    /// Count down the post-event idle frames and stop at the threshold.
    fn stop_recording(&mut self) {
        if self.event.idle_frames % self.fps == 0 {
            let remaining = self
                .config
                .recorder
                .timeout
                .saturating_sub((self.event.idle_frames / self.fps) as u64);
            tracing::info!(camera = %self.slug, seconds_remaining = remaining, "stopping recording");
        }

        if self.event.idle_frames >= self.fps * self.config.recorder.timeout as u32 {
            if !self.config.motion_detection.trigger_detector {
                self.gates.set_scan_for_motion(false);
                tracing::info!(camera = %self.slug, "pausing motion detector");
            }
            self.recorder.stop();
        }
    }

    fn publish_image(&mut self, object_frame: Option<&Frame>, motion_frame: Option<&Frame>) {
        // Draw on the object frame when present, else the motion frame
        let Some(frame) = object_frame.or(motion_frame) else {
            return;
        };

        let sx = frame.width as f32 / self.detector.model_width().max(1) as f32;
        let sy = frame.height as f32 / self.detector.model_height().max(1) as f32;

        let mask: Vec<Polygon> = self
            .overlay_mask
            .iter()
            .map(|p| scale_polygon(p, sx, sy))
            .collect();
        let zones: Vec<(Polygon, bool)> = self
            .zones
            .iter()
            .map(|z| (scale_polygon(z.polygon(), sx, sy), z.triggered()))
            .collect();

        let motion_dims = (
            self.config.motion_detection.width,
            self.config.motion_detection.height,
        );
        let contours = motion_frame
            .and_then(|f| f.motion_contours.as_ref())
            .map(|c| (c, motion_dims));

        let spec = OverlaySpec {
            mask: &mask,
            contours,
            zones: &zones,
            objects: &frame.objects,
        };
        if let Some(jpeg) = overlay::encode_annotated(frame, &spec) {
            self.camera_image.publish(jpeg);
        }
    }

    async fn shutdown_pipeline(&mut self) {
        tracing::info!(camera = %self.slug, "stopping nvr pipeline");
        self.source.release();
        if let Some(task) = self.capture_task.take() {
            let _ = task.await;
        }
        for task in self.stage_tasks.drain(..) {
            let _ = task.await;
        }
        if self.recorder.is_recording() {
            self.recorder.stop();
        }
        tracing::info!(camera = %self.slug, "nvr pipeline stopped");
    }
}

fn scale_polygon(polygon: &Polygon, sx: f32, sy: f32) -> Polygon {
    polygon
        .iter()
        .map(|p| Point::new((p.x as f32 * sx) as i32, (p.y as f32 * sy) as i32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::detector::DetectorError;
    use crate::broker::PublishItem;
    use crate::cleanup::SegmentCleanup;
    use crate::frame::BoundingBox;
    use crate::recorder::{RecorderError, SegmentMuxer};
    use std::path::{Path, PathBuf};

    struct TestSource {
        released: AtomicBool,
    }

    impl TestSource {
        fn new() -> Self {
            Self {
                released: AtomicBool::new(false),
            }
        }
    }

    impl FrameSource for TestSource {
        fn reopen(&self) {
            self.released.store(false, Ordering::SeqCst);
        }

        fn read(&self) -> Option<Frame> {
            None
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn resolution(&self) -> (u32, u32) {
            (640, 480)
        }

        fn fps(&self) -> u32 {
            10
        }
    }

    struct NullDetector;

    impl ObjectDetector for NullDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedObject>, DetectorError> {
            Ok(Vec::new())
        }

        fn model_width(&self) -> u32 {
            640
        }

        fn model_height(&self) -> u32 {
            480
        }
    }

    struct NullMuxer;

    impl SegmentMuxer for NullMuxer {
        fn begin(&self, _output: &Path, _lookback: &[PathBuf]) -> Result<(), RecorderError> {
            Ok(())
        }

        fn finish(&self) -> Result<(), RecorderError> {
            Ok(())
        }
    }

    fn test_config(dir: &Path, motion_timeout: bool) -> Arc<Config> {
        let toml_str = format!(
            r#"
            [recorder]
            folder = {:?}
            segments_folder = {:?}
            retain = 7
            lookback = 5
            timeout = 2

            [camera]
            name = "cam"
            host = "rtsp://example/stream"
            width = 640
            height = 480
            fps = 10

            [object_detection]
            labels = [{{ label = "person", confidence = 0.5, triggers_recording = true }}]

            [motion_detection]
            trigger_detector = true
            timeout = {}
            max_timeout = 5
            area = 100
            frames = 3
            "#,
            dir.join("recordings"),
            dir.join("segments"),
            motion_timeout,
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        config.validate().unwrap();
        Arc::new(config)
    }

    struct Harness {
        supervisor: Supervisor,
        source: Arc<TestSource>,
        publish_rx: mpsc::Receiver<PublishItem>,
    }

    fn harness(dir: &Path, motion_timeout: bool) -> Harness {
        let config = test_config(dir, motion_timeout);
        let source = Arc::new(TestSource::new());
        let (publisher, publish_rx) = Publisher::channel();
        let (post_processors, _post_rx) = PostProcessorDispatch::channel();
        let (_cleanup, cleanup_handle) = SegmentCleanup::new(&config.recorder, &config.camera.name);
        let recorder = Recorder::new(
            &config.recorder,
            &config.camera.name,
            &config.camera.name_slug(),
            Arc::new(NullMuxer),
            Arc::new(tokio::sync::Mutex::new(())),
            cleanup_handle,
        );
        let shutdown = Arc::new(AtomicBool::new(false));

        let (supervisor, _handle) = Supervisor::new(
            config,
            Arc::clone(&source) as Arc<dyn FrameSource>,
            Arc::new(NullDetector),
            None,
            recorder,
            publisher,
            post_processors,
            shutdown,
        );

        Harness {
            supervisor,
            source,
            publish_rx,
        }
    }

    fn person_frame() -> Frame {
        let mut frame = Frame::new(640, 480, vec![0; 640 * 480 * 3]);
        frame.objects.push(DetectedObject::new(
            "person",
            0.9,
            BoundingBox {
                x1: 100.0,
                y1: 100.0,
                x2: 300.0,
                y2: 400.0,
            },
        ));
        frame
    }

    fn empty_frame() -> Frame {
        Frame::new(640, 480, vec![0; 640 * 480 * 3])
    }

    fn drain_topics(rx: &mut mpsc::Receiver<PublishItem>) -> Vec<String> {
        let mut topics = Vec::new();
        while let Ok(item) = rx.try_recv() {
            topics.push(item.topic);
        }
        topics
    }

    #[tokio::test]
    async fn triggering_object_starts_and_idle_frames_stop_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        assert!(h.supervisor.recorder.is_recording());

        // recorder.timeout = 2s at 10 fps: stop lands on the 20th idle frame
        for i in 1..20 {
            h.supervisor.object_return_queue.push(empty_frame());
            h.supervisor.tick();
            assert!(h.supervisor.recorder.is_recording(), "still recording at idle frame {i}");
        }

        h.supervisor.object_return_queue.push(empty_frame());
        h.supervisor.tick();
        assert!(!h.supervisor.recorder.is_recording());
    }

    #[tokio::test]
    async fn recorder_does_not_restart_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        let first_start = h.supervisor.recorder.last_recording_start();

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        assert_eq!(h.supervisor.recorder.last_recording_start(), first_start);
    }

    #[tokio::test]
    async fn motion_sustains_event_until_max_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), true);

        h.supervisor.motion_filter.force_detected();
        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        assert!(h.supervisor.recorder.is_recording());

        // max_timeout = 5s at 10 fps: motion alone sustains 50 frames
        for i in 1..=50 {
            h.supervisor.object_return_queue.push(empty_frame());
            h.supervisor.tick();
            assert_eq!(h.supervisor.event.idle_frames, 0, "event active at frame {i}");
        }
        assert!(!h.supervisor.event.motion_max_timeout_reached);

        h.supervisor.object_return_queue.push(empty_frame());
        h.supervisor.tick();
        assert!(h.supervisor.event.motion_max_timeout_reached);
        assert_eq!(h.supervisor.event.idle_frames, 1);
        assert!(h.supervisor.recorder.is_recording());

        // From here the normal idle countdown runs
        for _ in 0..19 {
            h.supervisor.object_return_queue.push(empty_frame());
            h.supervisor.tick();
        }
        assert!(!h.supervisor.recorder.is_recording());
    }

    #[tokio::test]
    async fn object_publication_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        let first: Vec<String> = drain_topics(&mut h.publish_rx)
            .into_iter()
            .filter(|t| t == "cam/object_detected")
            .collect();
        assert_eq!(first.len(), 1);

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        let second: Vec<String> = drain_topics(&mut h.publish_rx)
            .into_iter()
            .filter(|t| t == "cam/object_detected")
            .collect();
        assert!(second.is_empty(), "unchanged object set must not republish");
    }

    #[tokio::test]
    async fn label_sensor_fires_on_presence_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        h.supervisor.object_return_queue.push(empty_frame());
        h.supervisor.tick();

        let label_topics: Vec<String> = drain_topics(&mut h.publish_rx)
            .into_iter()
            .filter(|t| t == "cam/object_detected person")
            .collect();
        assert_eq!(label_topics.len(), 2, "one publish per presence edge");
    }

    #[tokio::test]
    async fn status_follows_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);

        // trigger_detector mode: scanning for motion at startup
        h.supervisor.update_status();
        assert_eq!(
            h.supervisor.status_sensor.state(),
            Some(StatusState::ScanningForMotion)
        );

        h.supervisor.gates.set_scan_for_objects(true);
        h.supervisor.update_status();
        assert_eq!(
            h.supervisor.status_sensor.state(),
            Some(StatusState::ScanningForObjects)
        );

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        h.supervisor.update_status();
        assert_eq!(
            h.supervisor.status_sensor.state(),
            Some(StatusState::Recording)
        );
    }

    #[tokio::test]
    async fn toggle_off_releases_transport_and_stops_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);

        h.supervisor.object_return_queue.push(person_frame());
        h.supervisor.tick();
        assert!(h.supervisor.recorder.is_recording());

        h.supervisor.toggle_camera("OFF").await;
        assert!(h.source.released.load(Ordering::SeqCst));
        assert!(!h.supervisor.recorder.is_recording());

        h.supervisor.toggle_camera("ON").await;
        assert!(h.supervisor.capture_task.is_some());
        // The scripted source ends the stream immediately
        if let Some(task) = h.supervisor.capture_task.take() {
            task.await.unwrap();
        }
        assert!(!h.source.released.load(Ordering::SeqCst));

        // Unknown payloads are ignored
        h.supervisor.toggle_camera("garbage").await;
        assert!(!h.source.released.load(Ordering::SeqCst));
        assert!(!h.supervisor.recorder.is_recording());
    }

    #[tokio::test]
    async fn motion_edge_enables_object_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), false);
        assert!(!h.supervisor.gates.scan_for_objects());

        let mut frame = empty_frame();
        frame.motion_contours = Some(crate::frame::MotionContours {
            contours: Vec::new(),
            max_area: 150.0,
        });

        // Three consecutive motion frames pass the debounce
        for _ in 0..3 {
            h.supervisor.motion_return_queue.push(frame.clone());
            h.supervisor.tick();
        }
        assert!(h.supervisor.motion_filter.detected());
        assert!(h.supervisor.gates.scan_for_objects());

        // Motion stops: object scan is paused again while not recording
        let mut still = empty_frame();
        still.motion_contours = Some(crate::frame::MotionContours::default());
        h.supervisor.motion_return_queue.push(still);
        h.supervisor.tick();
        assert!(!h.supervisor.gates.scan_for_objects());
    }
}
