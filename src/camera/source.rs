use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::config::CameraConfig;
use crate::frame::Frame;

use super::capture::FrameSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),
}

/// Decoded-frame transport backed by an ffmpeg child process reading the
/// camera stream and emitting raw RGB24 frames on stdout.
pub struct FfmpegSource {
    host: String,
    camera: String,
    width: u32,
    height: u32,
    fps: u32,
    released: AtomicBool,
    child: Mutex<Option<Child>>,
    stdout: Mutex<Option<ChildStdout>>,
}

impl FfmpegSource {
    /// Spawn the decoder pipeline up front so a bad transport fails at
    /// startup instead of inside the capture loop.
    pub fn connect(config: &CameraConfig) -> Result<Self, SourceError> {
        let source = Self {
            host: config.host.clone(),
            camera: config.name_slug(),
            width: config.width,
            height: config.height,
            fps: config.fps,
            released: AtomicBool::new(false),
            child: Mutex::new(None),
            stdout: Mutex::new(None),
        };
        source.spawn_ffmpeg()?;
        tracing::info!(camera = %source.camera, host = %source.host, "transport connected");
        Ok(source)
    }

    fn spawn_ffmpeg(&self) -> Result<(), SourceError> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "warning",
                "-rtsp_transport",
                "tcp",
                "-i",
                &self.host,
                "-an",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{}x{}", self.width, self.height),
                "-r",
                &self.fps.to_string(),
                "pipe:1",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SourceError::FfmpegNotFound
                } else {
                    SourceError::Io(e)
                }
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SourceError::FfmpegFailed("failed to capture stdout".to_string())
        })?;

        *self.stdout.lock().unwrap() = Some(stdout);
        *self.child.lock().unwrap() = Some(child);
        Ok(())
    }

    fn kill_child(&self) {
        self.stdout.lock().unwrap().take();
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn frame_size(&self) -> usize {
        (self.width * self.height * 3) as usize
    }
}

impl FrameSource for FfmpegSource {
    fn reopen(&self) {
        self.released.store(false, Ordering::Release);
    }

    fn read(&self) -> Option<Frame> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }

        // Reconnect lazily after a release/stream end
        if self.stdout.lock().unwrap().is_none() {
            if let Err(e) = self.spawn_ffmpeg() {
                tracing::error!(camera = %self.camera, error = %e, "failed to restart transport");
                return None;
            }
        }

        let mut buf = vec![0u8; self.frame_size()];
        let mut guard = self.stdout.lock().unwrap();
        let Some(stdout) = guard.as_mut() else {
            return None;
        };

        match stdout.read_exact(&mut buf) {
            Ok(()) => Some(Frame::new(self.width, self.height, buf)),
            Err(e) => {
                if !self.released.load(Ordering::Acquire) {
                    tracing::warn!(camera = %self.camera, error = %e, "stream ended");
                }
                guard.take();
                None
            }
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.kill_child();
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> u32 {
        self.fps
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.kill_child();
    }
}
