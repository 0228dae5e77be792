use std::time::Instant;

use serde_json::json;

/// A single point in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Closed polygon in frame coordinates. The closing edge from the last
/// vertex back to the first is implicit.
pub type Polygon = Vec<Point>;

/// Ray-cast point-in-polygon test. Points on an edge count as inside.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let (px, py) = (point.x as f64, point.y as f64);
    let mut inside = false;
    let mut j = polygon.len() - 1;

    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].x as f64, polygon[i].y as f64);
        let (xj, yj) = (polygon[j].x as f64, polygon[j].y as f64);

        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }

    inside
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new(
            ((self.x1 + self.x2) / 2.0) as i32,
            ((self.y1 + self.y2) / 2.0) as i32,
        )
    }
}

/// An object reported by the detector, in frame coordinates.
/// `relevant` is set once the object passes a configured filter.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub relevant: bool,
}

impl DetectedObject {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            relevant: false,
        }
    }

    /// Compact projection used in broker attributes and debug logs.
    pub fn formatted(&self) -> serde_json::Value {
        json!({
            "label": self.label,
            "confidence": format!("{:.2}", self.confidence),
            "bbox": [self.bbox.x1, self.bbox.y1, self.bbox.x2, self.bbox.y2],
        })
    }
}

/// A single motion contour with its pixel area.
#[derive(Debug, Clone)]
pub struct Contour {
    pub points: Vec<Point>,
    pub area: f32,
}

/// Contours found by the motion analyzer for one frame.
#[derive(Debug, Clone, Default)]
pub struct MotionContours {
    pub contours: Vec<Contour>,
    pub max_area: f32,
}

impl MotionContours {
    pub fn new(contours: Vec<Contour>) -> Self {
        let max_area = contours.iter().map(|c| c.area).fold(0.0, f32::max);
        Self { contours, max_area }
    }
}

/// A decoded video frame owned by whichever stage currently holds it.
/// Analyzer annotations are attached as the frame moves down the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Instant,
    pub width: u32,
    pub height: u32,
    /// Raw RGB24 pixels, row-major.
    pub pixels: Vec<u8>,
    pub objects: Vec<DetectedObject>,
    pub motion_contours: Option<MotionContours>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            timestamp: Instant::now(),
            width,
            height,
            pixels,
            objects: Vec::new(),
            motion_contours: None,
        }
    }

    /// Resize to new dimensions with nearest-neighbour sampling, keeping
    /// timestamp and annotations.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        let image = image::RgbImage::from_raw(self.width, self.height, self.pixels.clone());
        let pixels = match image {
            Some(img) => image::imageops::resize(
                &img,
                width,
                height,
                image::imageops::FilterType::Nearest,
            )
            .into_raw(),
            None => vec![0; (width * height * 3) as usize],
        };

        Frame {
            timestamp: self.timestamp,
            width,
            height,
            pixels,
            objects: self.objects.clone(),
            motion_contours: self.motion_contours.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        vec![
            Point::new(0, 0),
            Point::new(100, 0),
            Point::new(100, 100),
            Point::new(0, 100),
        ]
    }

    #[test]
    fn point_inside_square() {
        assert!(point_in_polygon(Point::new(50, 50), &square()));
    }

    #[test]
    fn point_outside_square() {
        assert!(!point_in_polygon(Point::new(150, 50), &square()));
        assert!(!point_in_polygon(Point::new(50, -1), &square()));
    }

    #[test]
    fn degenerate_polygon_is_never_inside() {
        let line = vec![Point::new(0, 0), Point::new(10, 10)];
        assert!(!point_in_polygon(Point::new(5, 5), &line));
    }

    #[test]
    fn bbox_center() {
        let bbox = BoundingBox {
            x1: 10.0,
            y1: 20.0,
            x2: 30.0,
            y2: 40.0,
        };
        assert_eq!(bbox.center(), Point::new(20, 30));
    }

    #[test]
    fn resize_preserves_annotations() {
        let mut frame = Frame::new(4, 4, vec![0; 48]);
        frame.objects.push(DetectedObject::new(
            "person",
            0.9,
            BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
        ));
        let resized = frame.resized(2, 2);
        assert_eq!(resized.width, 2);
        assert_eq!(resized.pixels.len(), 12);
        assert_eq!(resized.objects.len(), 1);
    }
}
