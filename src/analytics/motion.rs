use std::sync::Mutex;

use crate::config::MotionDetectionConfig;
use crate::frame::{point_in_polygon, Contour, Frame, MotionContours, Point, Polygon};

use super::detector::{DetectorError, MotionAnalyzer};

const BLOCK_SIZE: u32 = 8;
const PIXEL_DIFF_THRESHOLD: u8 = 25;
/// Changed pixels a block needs before it counts as active.
const BLOCK_ACTIVE_MIN: u32 = 8;

/// Frame-differencing motion analyzer: grayscale delta against the
/// previous frame, active 8×8 blocks clustered into contours. Blocks whose
/// center falls inside a mask polygon are ignored.
pub struct FrameDiffMotion {
    mask: Vec<Polygon>,
    previous: Mutex<Option<Vec<u8>>>,
}

impl FrameDiffMotion {
    /// Mask polygons are expected in motion-resolution coordinates.
    pub fn new(mask: Vec<Polygon>) -> Self {
        Self {
            mask,
            previous: Mutex::new(None),
        }
    }

    fn masked(&self, x: u32, y: u32) -> bool {
        if self.mask.is_empty() {
            return false;
        }
        let center = Point::new(
            (x * BLOCK_SIZE + BLOCK_SIZE / 2) as i32,
            (y * BLOCK_SIZE + BLOCK_SIZE / 2) as i32,
        );
        self.mask.iter().any(|p| point_in_polygon(center, p))
    }
}

fn grayscale(frame: &Frame) -> Vec<u8> {
    frame
        .pixels
        .chunks_exact(3)
        .map(|px| ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8)
        .collect()
}

impl MotionAnalyzer for FrameDiffMotion {
    fn analyze(&self, frame: &Frame) -> Result<MotionContours, DetectorError> {
        let gray = grayscale(frame);

        let previous = {
            let mut guard = match self.previous.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.replace(gray.clone())
        };

        let Some(previous) = previous else {
            return Ok(MotionContours::default());
        };
        if previous.len() != gray.len() {
            return Ok(MotionContours::default());
        }

        let width = frame.width;
        let height = frame.height;
        let blocks_x = width.div_ceil(BLOCK_SIZE) as usize;
        let blocks_y = height.div_ceil(BLOCK_SIZE) as usize;
        let mut changed = vec![0u32; blocks_x * blocks_y];

        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as usize;
                let diff = gray[idx].abs_diff(previous[idx]);
                if diff > PIXEL_DIFF_THRESHOLD {
                    changed[(y / BLOCK_SIZE) as usize * blocks_x + (x / BLOCK_SIZE) as usize] += 1;
                }
            }
        }

        let mut active = vec![false; blocks_x * blocks_y];
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                active[by * blocks_x + bx] = changed[by * blocks_x + bx] >= BLOCK_ACTIVE_MIN
                    && !self.masked(bx as u32, by as u32);
            }
        }

        Ok(MotionContours::new(cluster_blocks(
            &active, &changed, blocks_x, blocks_y,
        )))
    }
}

/// Merge 4-connected active blocks into contours. Each contour is the
/// bounding rectangle of its cluster; the area is the changed-pixel count.
fn cluster_blocks(
    active: &[bool],
    changed: &[u32],
    blocks_x: usize,
    blocks_y: usize,
) -> Vec<Contour> {
    let mut visited = vec![false; active.len()];
    let mut contours = Vec::new();

    for start in 0..active.len() {
        if !active[start] || visited[start] {
            continue;
        }

        let mut stack = vec![start];
        visited[start] = true;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut area = 0u32;

        while let Some(idx) = stack.pop() {
            let (bx, by) = (idx % blocks_x, idx / blocks_x);
            min_x = min_x.min(bx);
            min_y = min_y.min(by);
            max_x = max_x.max(bx);
            max_y = max_y.max(by);
            area += changed[idx];

            let mut push = |nx: usize, ny: usize| {
                let nidx = ny * blocks_x + nx;
                if active[nidx] && !visited[nidx] {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            };
            if bx > 0 {
                push(bx - 1, by);
            }
            if bx + 1 < blocks_x {
                push(bx + 1, by);
            }
            if by > 0 {
                push(bx, by - 1);
            }
            if by + 1 < blocks_y {
                push(bx, by + 1);
            }
        }

        let block = BLOCK_SIZE as i32;
        let (x1, y1) = (min_x as i32 * block, min_y as i32 * block);
        let (x2, y2) = ((max_x as i32 + 1) * block, (max_y as i32 + 1) * block);
        contours.push(Contour {
            points: vec![
                Point::new(x1, y1),
                Point::new(x2, y1),
                Point::new(x2, y2),
                Point::new(x1, y2),
            ],
            area: area as f32,
        });
    }

    contours
}

/// Consecutive-frames debounce over contour areas. `process` returns the
/// new state on a transition and None otherwise.
pub struct MotionFilter {
    area_threshold: f32,
    required_frames: u32,
    frames_run: u32,
    detected: bool,
}

impl MotionFilter {
    pub fn new(config: &MotionDetectionConfig) -> Self {
        Self {
            area_threshold: config.area as f32,
            required_frames: config.frames,
            frames_run: 0,
            detected: false,
        }
    }

    pub fn process(&mut self, contours: &MotionContours) -> Option<bool> {
        if contours.max_area > self.area_threshold {
            self.frames_run += 1;
            tracing::debug!(
                consecutive_frames = self.frames_run,
                max_area = contours.max_area,
                "motion frame"
            );

            if self.frames_run >= self.required_frames && !self.detected {
                self.detected = true;
                return Some(true);
            }
            None
        } else {
            self.frames_run = 0;
            if self.detected {
                self.detected = false;
                Some(false)
            } else {
                None
            }
        }
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    #[cfg(test)]
    pub fn force_detected(&mut self) {
        self.frames_run = self.required_frames;
        self.detected = true;
    }
}
