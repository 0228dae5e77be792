use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::config::RecorderConfig;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const SEGMENT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
/// Hour (UTC) of the daily retention sweep.
const RETENTION_SWEEP_HOUR: u32 = 1;

/// Daily sweep of finished recordings and thumbnails past the retention
/// period, followed by pruning of emptied date directories.
pub struct RetentionSweeper {
    root: PathBuf,
    days_to_retain: u32,
}

impl RetentionSweeper {
    pub fn new(config: &RecorderConfig) -> Self {
        let days_to_retain = match config.retain {
            Some(days) => days,
            None => {
                tracing::error!(
                    "Number of days to retain recordings is not specified. Defaulting to 7"
                );
                7
            }
        };

        Self {
            root: config.folder.clone(),
            days_to_retain,
        }
    }

    pub fn days_to_retain(&self) -> u32 {
        self.days_to_retain
    }

    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        loop {
            tokio::time::sleep(until_next_sweep(Utc::now())).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.sweep();
        }
    }

    pub fn sweep(&self) {
        self.sweep_at(SystemTime::now());
    }

    pub fn sweep_at(&self, now: SystemTime) {
        tracing::debug!(root = %self.root.display(), "running retention sweep");
        let cutoff = now - Duration::from_secs(self.days_to_retain as u64 * SECONDS_PER_DAY);

        remove_expired_files(&self.root, cutoff);
        prune_date_directories(&self.root);
    }
}

fn remove_expired_files(dir: &Path, cutoff: SystemTime) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to read directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_expired_files(&path, cutoff);
            continue;
        }

        let is_media = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "mp4" || e == "jpg");
        if !is_media {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime <= cutoff)
            .unwrap_or(false);
        if !expired {
            continue;
        }

        tracing::debug!(file = %path.display(), "removing expired file");
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::error!(file = %path.display(), error = %e, "could not remove file");
        }
    }
}

/// Matches the date-directory layout `YYYY-MM-DD`. Any name with three
/// dash-separated parts matches; the parts are not checked for being a
/// real date.
fn is_date_shaped(name: &str) -> bool {
    name.split('-').count() == 3
}

fn prune_date_directories(root: &Path) {
    let mut date_dirs = Vec::new();
    collect_date_dirs(root, &mut date_dirs);

    for dir in date_dirs {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && dir_is_empty(&path) {
                    remove_dir_logged(&path);
                }
            }
        }
        if dir_is_empty(&dir) {
            remove_dir_logged(&dir);
        }
    }
}

fn collect_date_dirs(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name_matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_date_shaped);
        if name_matches {
            out.push(path.clone());
        }
        collect_date_dirs(&path, out);
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn remove_dir_logged(dir: &Path) {
    tracing::debug!(dir = %dir.display(), "removing directory");
    if let Err(e) = std::fs::remove_dir(dir) {
        tracing::error!(dir = %dir.display(), error = %e, "could not remove directory");
    }
}

fn until_next_sweep(now: DateTime<Utc>) -> Duration {
    let today_sweep = now
        .date_naive()
        .and_hms_opt(RETENTION_SWEEP_HOUR, 0, 0)
        .map(|dt| dt.and_utc());

    let next = match today_sweep {
        Some(sweep) if sweep > now => sweep,
        Some(sweep) => sweep + chrono::Duration::days(1),
        None => now + chrono::Duration::days(1),
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(SECONDS_PER_DAY))
}

/// Pause/resume control shared with the recorder: while paused (an active
/// mux), the TTL job skips its runs but keeps its schedule.
#[derive(Clone)]
pub struct SegmentCleanupHandle {
    paused: Arc<AtomicBool>,
}

impl SegmentCleanupHandle {
    pub fn pause(&self) {
        tracing::debug!("pausing segment cleanup");
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        tracing::debug!("resuming segment cleanup");
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// TTL sweep over the per-camera ring of lookback segments. Runs every
/// segment duration; a segment may only be deleted once it can no longer
/// be needed by a recording's lookback.
pub struct SegmentCleanup {
    directory: PathBuf,
    max_age: Duration,
    period: Duration,
    paused: Arc<AtomicBool>,
}

impl SegmentCleanup {
    pub fn new(config: &RecorderConfig, camera_name: &str) -> (Self, SegmentCleanupHandle) {
        let paused = Arc::new(AtomicBool::new(false));
        let cleanup = Self {
            directory: config.segments_folder.join(camera_name),
            max_age: Duration::from_secs(config.lookback + 3 * config.segment_duration),
            period: Duration::from_secs(config.segment_duration),
            paused: Arc::clone(&paused),
        };
        (cleanup, SegmentCleanupHandle { paused })
    }

    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        tracing::debug!(dir = %self.directory.display(), "starting segment cleanup");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if self.paused.load(Ordering::Acquire) {
                continue;
            }
            self.sweep_at(Utc::now());
        }
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.directory.display(), error = %e, "failed to read segments directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(start) = segment_start_time(&path) else {
                tracing::trace!(file = %path.display(), "skipping segment with unparsable name");
                continue;
            };

            let age = (now - start).to_std().unwrap_or(Duration::ZERO);
            if age > self.max_age {
                tracing::debug!(file = %path.display(), "removing expired segment");
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(file = %path.display(), error = %e, "could not remove segment");
                }
            }
        }
    }
}

/// Parse the basename before the first `.` as `%Y%m%d%H%M%S` (UTC).
pub fn segment_start_time(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next()?;
    NaiveDateTime::parse_from_str(stem, SEGMENT_TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder_config(root: &Path, segments: &Path, retain: Option<u32>) -> RecorderConfig {
        let retain_line = match retain {
            Some(days) => format!("retain = {days}\n"),
            None => String::new(),
        };
        toml::from_str(&format!(
            "folder = {:?}\nsegments_folder = {:?}\n{}lookback = 30\nsegment_duration = 5",
            root, segments, retain_line
        ))
        .unwrap()
    }

    #[test]
    fn missing_retain_defaults_to_seven_days() {
        let dir = tempfile::tempdir().unwrap();
        let config = recorder_config(dir.path(), dir.path(), None);
        let sweeper = RetentionSweeper::new(&config);
        assert_eq!(sweeper.days_to_retain(), 7);
    }

    #[test]
    fn retention_removes_only_expired_media() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("cam").join("2024-01-01");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("120000.mp4"), b"v").unwrap();
        std::fs::write(day.join("120000.jpg"), b"t").unwrap();
        std::fs::write(day.join("notes.txt"), b"n").unwrap();

        let config = recorder_config(dir.path(), dir.path(), Some(7));
        let sweeper = RetentionSweeper::new(&config);

        // Sweep "now": files are brand new, nothing is expired
        sweeper.sweep();
        assert!(day.join("120000.mp4").exists());

        // Sweep from 8 days in the future: mtimes fall past the cutoff
        let future = SystemTime::now() + Duration::from_secs(8 * SECONDS_PER_DAY);
        sweeper.sweep_at(future);
        assert!(!day.join("120000.mp4").exists());
        assert!(!day.join("120000.jpg").exists());
        assert!(day.join("notes.txt").exists(), "non-media files are kept");
    }

    #[test]
    fn emptied_date_directories_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("cam").join("2024-01-01");
        let sub = day.join("leftover");
        std::fs::create_dir_all(&sub).unwrap();

        let config = recorder_config(dir.path(), dir.path(), Some(7));
        RetentionSweeper::new(&config).sweep();

        assert!(!sub.exists());
        assert!(!day.exists());
        assert!(dir.path().join("cam").exists());
    }

    #[test]
    fn date_shape_matching_is_loose() {
        assert!(is_date_shaped("2024-01-01"));
        assert!(is_date_shaped("a-b-c"));
        assert!(!is_date_shaped("2024-01"));
        assert!(!is_date_shaped("segments"));
    }

    #[test]
    fn segment_sweep_respects_lookback_margin() {
        let dir = tempfile::tempdir().unwrap();
        let cam_dir = dir.path().join("cam");
        std::fs::create_dir_all(&cam_dir).unwrap();

        std::fs::write(cam_dir.join("20240101000800.ts"), b"old").unwrap();
        std::fs::write(cam_dir.join("20240101000930.ts"), b"recent").unwrap();
        std::fs::write(cam_dir.join("20240101001000.ts"), b"new").unwrap();
        std::fs::write(cam_dir.join("garbage.ts"), b"x").unwrap();

        let config = recorder_config(dir.path(), dir.path(), Some(7));
        let (cleanup, _handle) = SegmentCleanup::new(&config, "cam");

        // max age = lookback 30 + 3 * 5 = 45 seconds
        let now = "2024-01-01T00:10:00Z".parse::<DateTime<Utc>>().unwrap();
        cleanup.sweep_at(now);

        assert!(!cam_dir.join("20240101000800.ts").exists(), "age 120s > 45s");
        assert!(cam_dir.join("20240101000930.ts").exists(), "age 30s <= 45s");
        assert!(cam_dir.join("20240101001000.ts").exists(), "age 0s");
        assert!(cam_dir.join("garbage.ts").exists(), "unparsable names kept");
    }

    #[test]
    fn pause_resume_toggles_handle() {
        let dir = tempfile::tempdir().unwrap();
        let config = recorder_config(dir.path(), dir.path(), Some(7));
        let (_cleanup, handle) = SegmentCleanup::new(&config, "cam");

        assert!(!handle.is_paused());
        handle.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
    }

    #[test]
    fn next_sweep_is_at_one_utc() {
        let before = "2024-06-01T00:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(until_next_sweep(before), Duration::from_secs(30 * 60));

        let after = "2024-06-01T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(until_next_sweep(after), Duration::from_secs(23 * 60 * 60));
    }
}
