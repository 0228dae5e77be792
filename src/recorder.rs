use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::analytics::detector::DetectionLock;
use crate::cleanup::{segment_start_time, SegmentCleanupHandle};
use crate::config::RecorderConfig;
use crate::frame::{DetectedObject, Frame};
use crate::overlay;

const DATE_DIR_FORMAT: &str = "%Y-%m-%d";
const FILE_TIME_FORMAT: &str = "%H%M%S";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
}

/// External mux collaborator: stitches the lookback ring and the live
/// segments into the output file.
pub trait SegmentMuxer: Send + Sync {
    fn begin(&self, output: &Path, lookback: &[PathBuf]) -> Result<(), RecorderError>;
    fn finish(&self) -> Result<(), RecorderError>;
}

/// Concat muxer backed by an ffmpeg child process fed a concat list of
/// the pre-captured segments.
pub struct FfmpegMuxer {
    child: Mutex<Option<Child>>,
}

impl FfmpegMuxer {
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
        }
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentMuxer for FfmpegMuxer {
    fn begin(&self, output: &Path, lookback: &[PathBuf]) -> Result<(), RecorderError> {
        let list_path = output.with_extension("segments.txt");
        let mut list = std::fs::File::create(&list_path)?;
        for segment in lookback {
            writeln!(list, "file '{}'", segment.display())?;
        }

        let child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "warning",
                "-y",
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
            ])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RecorderError::FfmpegNotFound
                } else {
                    RecorderError::Io(e)
                }
            })?;

        *self.child.lock().unwrap() = Some(child);
        Ok(())
    }

    fn finish(&self) -> Result<(), RecorderError> {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.wait()?;
        }
        Ok(())
    }
}

/// A single recording's bookkeeping, from the trigger frame to the muxed
/// output file.
#[derive(Debug, Clone)]
pub struct Recording {
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub segment_dir: PathBuf,
    pub output_file: PathBuf,
    pub thumbnail_path: PathBuf,
    pub triggering_objects: Vec<DetectedObject>,
}

/// Drives segmented recordings: start splices the lookback ring in front
/// of the live stream, stop finalizes the output file. Start runs
/// detached so the supervisor keeps polling frames.
pub struct Recorder {
    camera_name: String,
    slug: String,
    folder: PathBuf,
    segments_dir: PathBuf,
    lookback_secs: u64,
    is_recording: Arc<AtomicBool>,
    last_start: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_end: Arc<RwLock<Option<DateTime<Utc>>>>,
    active: Arc<Mutex<Option<Recording>>>,
    muxer: Arc<dyn SegmentMuxer>,
    detection_lock: DetectionLock,
    segment_cleanup: SegmentCleanupHandle,
}

impl Recorder {
    pub fn new(
        config: &RecorderConfig,
        camera_name: &str,
        slug: &str,
        muxer: Arc<dyn SegmentMuxer>,
        detection_lock: DetectionLock,
        segment_cleanup: SegmentCleanupHandle,
    ) -> Self {
        Self {
            camera_name: camera_name.to_string(),
            slug: slug.to_string(),
            folder: config.folder.clone(),
            segments_dir: config.segments_folder.join(camera_name),
            lookback_secs: config.lookback,
            is_recording: Arc::new(AtomicBool::new(false)),
            last_start: Arc::new(RwLock::new(None)),
            last_end: Arc::new(RwLock::new(None)),
            active: Arc::new(Mutex::new(None)),
            muxer,
            detection_lock,
            segment_cleanup,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Acquire)
    }

    pub fn last_recording_start(&self) -> Option<DateTime<Utc>> {
        *self.last_start.read().unwrap()
    }

    pub fn last_recording_end(&self) -> Option<DateTime<Utc>> {
        *self.last_end.read().unwrap()
    }

    pub fn active_recording(&self) -> Option<Recording> {
        self.active.lock().unwrap().clone()
    }

    /// Begin a new recording. The mux start happens on a detached task
    /// under the detection lock; the recording is visible as active
    /// immediately so the supervisor never double-starts.
    pub fn start(
        &self,
        frame: Option<&Frame>,
        triggering_objects: Vec<DetectedObject>,
        _resolution: (u32, u32),
    ) {
        if self.is_recording.swap(true, Ordering::AcqRel) {
            return;
        }

        let now = Utc::now();
        *self.last_start.write().unwrap() = Some(now);
        self.segment_cleanup.pause();

        let date_dir = self.folder.join(&self.camera_name).join(now.format(DATE_DIR_FORMAT).to_string());
        let base_name = now.format(FILE_TIME_FORMAT).to_string();
        let recording = Recording {
            start_ts: now,
            end_ts: None,
            segment_dir: self.segments_dir.clone(),
            output_file: date_dir.join(format!("{base_name}.mp4")),
            thumbnail_path: date_dir.join(format!("{base_name}.jpg")),
            triggering_objects,
        };
        *self.active.lock().unwrap() = Some(recording.clone());

        tracing::info!(camera = %self.slug, output = %recording.output_file.display(), "starting recording");

        let thumbnail = frame.and_then(overlay::encode_jpeg);
        let lookback = self.lookback_segments(now);
        let muxer = Arc::clone(&self.muxer);
        let detection_lock = Arc::clone(&self.detection_lock);
        let slug = self.slug.clone();

        tokio::spawn(async move {
            // Mux and inference contend for the same bottleneck
            let _guard = detection_lock.lock().await;

            if let Err(e) = tokio::fs::create_dir_all(&date_dir).await {
                tracing::error!(camera = %slug, error = %e, "failed to create recording directory");
                return;
            }

            if let Some(jpeg) = thumbnail {
                if let Err(e) = tokio::fs::write(&recording.thumbnail_path, jpeg).await {
                    tracing::error!(camera = %slug, error = %e, "failed to write thumbnail");
                }
            }

            let output = recording.output_file.clone();
            let result =
                tokio::task::spawn_blocking(move || muxer.begin(&output, &lookback)).await;
            match result {
                Ok(Ok(())) => {
                    tracing::debug!(camera = %slug, "recording mux started");
                }
                Ok(Err(e)) => {
                    tracing::error!(camera = %slug, error = %e, "failed to start mux");
                }
                Err(e) => {
                    tracing::error!(camera = %slug, error = %e, "mux task panicked");
                }
            }
        });
    }

    /// Finalize the active recording.
    pub fn stop(&self) {
        if !self.is_recording.swap(false, Ordering::AcqRel) {
            return;
        }

        let now = Utc::now();
        *self.last_end.write().unwrap() = Some(now);

        let finished = {
            let mut active = self.active.lock().unwrap();
            active.take().map(|mut r| {
                r.end_ts = Some(now);
                r
            })
        };
        if let Some(recording) = &finished {
            tracing::info!(camera = %self.slug, output = %recording.output_file.display(), "stopping recording");
        }

        let muxer = Arc::clone(&self.muxer);
        let segment_cleanup = self.segment_cleanup.clone();
        let slug = self.slug.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || muxer.finish()).await;
            if let Ok(Err(e)) = result {
                tracing::error!(camera = %slug, error = %e, "failed to finalize recording");
            }
            segment_cleanup.resume();
        });
    }

    /// Segments young enough to belong to this recording's lookback.
    fn lookback_segments(&self, now: DateTime<Utc>) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.segments_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    camera = %self.slug,
                    dir = %self.segments_dir.display(),
                    error = %e,
                    "failed to read segments directory"
                );
                return Vec::new();
            }
        };

        let mut segments: Vec<(DateTime<Utc>, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let start = segment_start_time(&path)?;
                let age = (now - start).num_seconds();
                (age >= 0 && age as u64 <= self.lookback_secs).then_some((start, path))
            })
            .collect();

        segments.sort_by_key(|(start, _)| *start);
        segments.into_iter().map(|(_, path)| path).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::SegmentCleanup;

    pub(crate) struct NullMuxer;

    impl SegmentMuxer for NullMuxer {
        fn begin(&self, _output: &Path, _lookback: &[PathBuf]) -> Result<(), RecorderError> {
            Ok(())
        }

        fn finish(&self) -> Result<(), RecorderError> {
            Ok(())
        }
    }

    fn test_recorder(dir: &Path) -> (Recorder, SegmentCleanupHandle) {
        let config: RecorderConfig = toml::from_str(&format!(
            "folder = {:?}\nsegments_folder = {:?}\nretain = 7\nlookback = 30",
            dir.join("recordings"),
            dir.join("segments"),
        ))
        .unwrap();
        let (_cleanup, handle) = SegmentCleanup::new(&config, "cam");
        let recorder = Recorder::new(
            &config,
            "cam",
            "cam",
            Arc::new(NullMuxer),
            Arc::new(tokio::sync::Mutex::new(())),
            handle.clone(),
        );
        (recorder, handle)
    }

    #[tokio::test]
    async fn start_and_stop_track_state() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, handle) = test_recorder(dir.path());

        assert!(!recorder.is_recording());
        recorder.start(None, Vec::new(), (640, 480));
        assert!(recorder.is_recording());
        assert!(handle.is_paused());
        assert!(recorder.last_recording_start().is_some());
        assert!(recorder.active_recording().is_some());

        recorder.stop();
        assert!(!recorder.is_recording());
        assert!(recorder.last_recording_end().is_some());
        assert!(recorder.active_recording().is_none());
    }

    #[tokio::test]
    async fn second_start_is_ignored_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _handle) = test_recorder(dir.path());

        recorder.start(None, Vec::new(), (640, 480));
        let first = recorder.last_recording_start();
        recorder.start(None, Vec::new(), (640, 480));
        assert_eq!(recorder.last_recording_start(), first);

        recorder.stop();
        recorder.stop();
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn output_paths_follow_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _handle) = test_recorder(dir.path());

        recorder.start(None, Vec::new(), (640, 480));
        let recording = recorder.active_recording().unwrap();

        let output = recording.output_file.to_string_lossy().into_owned();
        assert!(output.starts_with(&dir.path().join("recordings").join("cam").to_string_lossy().into_owned()));
        assert!(output.ends_with(".mp4"));
        assert_eq!(recording.thumbnail_path.extension().unwrap(), "jpg");
        recorder.stop();
    }

    #[test]
    fn lookback_selection_ignores_old_and_unparsable() {
        let dir = tempfile::tempdir().unwrap();
        let segments = dir.path().join("segments").join("cam");
        std::fs::create_dir_all(&segments).unwrap();
        std::fs::write(segments.join("20240101000940.ts"), b"a").unwrap();
        std::fs::write(segments.join("20240101000800.ts"), b"b").unwrap();
        std::fs::write(segments.join("junk.ts"), b"c").unwrap();

        let (recorder, _handle) = {
            let config: RecorderConfig = toml::from_str(&format!(
                "folder = {:?}\nsegments_folder = {:?}\nretain = 7\nlookback = 30",
                dir.path().join("recordings"),
                dir.path().join("segments"),
            ))
            .unwrap();
            let (_cleanup, handle) = SegmentCleanup::new(&config, "cam");
            (
                Recorder::new(
                    &config,
                    "cam",
                    "cam",
                    Arc::new(NullMuxer),
                    Arc::new(tokio::sync::Mutex::new(())),
                    handle.clone(),
                ),
                handle,
            )
        };

        let now = "2024-01-01T00:10:00Z".parse::<DateTime<Utc>>().unwrap();
        let lookback = recorder.lookback_segments(now);
        assert_eq!(lookback.len(), 1);
        assert!(lookback[0].ends_with("20240101000940.ts"));
    }
}
