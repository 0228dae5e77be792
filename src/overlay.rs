use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::frame::{DetectedObject, Frame, MotionContours, Polygon};

/// Low quality to save broker bandwidth.
const JPEG_QUALITY: u8 = 75;

const MASK_COLOR: Rgb<u8> = Rgb([100, 100, 100]);
const CONTOUR_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const ZONE_IDLE_COLOR: Rgb<u8> = Rgb([0, 150, 0]);
const ZONE_TRIGGERED_COLOR: Rgb<u8> = Rgb([200, 0, 0]);
const OBJECT_COLOR: Rgb<u8> = Rgb([0, 150, 0]);
const IRRELEVANT_OBJECT_COLOR: Rgb<u8> = Rgb([150, 150, 150]);

/// Everything drawn on top of a frame before it is published.
pub struct OverlaySpec<'a> {
    pub mask: &'a [Polygon],
    /// Contours and the resolution of the frame they were measured on.
    pub contours: Option<(&'a MotionContours, (u32, u32))>,
    /// Zone polygons with their current trigger state.
    pub zones: &'a [(Polygon, bool)],
    pub objects: &'a [DetectedObject],
}

/// Draw the overlay layers in order (mask, contours, zones, objects) onto an
/// RGB copy of the frame and JPEG-encode the result.
pub fn encode_annotated(frame: &Frame, spec: &OverlaySpec) -> Option<Vec<u8>> {
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone())?;

    for polygon in spec.mask {
        draw_polygon(&mut image, polygon, MASK_COLOR);
    }

    if let Some((contours, (src_w, src_h))) = spec.contours {
        let scale_x = frame.width as f32 / src_w.max(1) as f32;
        let scale_y = frame.height as f32 / src_h.max(1) as f32;
        for contour in &contours.contours {
            let scaled: Polygon = contour
                .points
                .iter()
                .map(|p| crate::frame::Point {
                    x: (p.x as f32 * scale_x) as i32,
                    y: (p.y as f32 * scale_y) as i32,
                })
                .collect();
            draw_polygon(&mut image, &scaled, CONTOUR_COLOR);
        }
    }

    for (polygon, triggered) in spec.zones {
        let color = if *triggered {
            ZONE_TRIGGERED_COLOR
        } else {
            ZONE_IDLE_COLOR
        };
        draw_polygon(&mut image, polygon, color);
    }

    for object in spec.objects {
        let color = if object.relevant {
            OBJECT_COLOR
        } else {
            IRRELEVANT_OBJECT_COLOR
        };
        draw_bbox(&mut image, object, color);
    }

    encode_image(&image)
}

/// JPEG-encode a frame without annotations. Used for recording thumbnails.
pub fn encode_jpeg(frame: &Frame) -> Option<Vec<u8>> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone())?;
    encode_image(&image)
}

fn encode_image(image: &RgbImage) -> Option<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    match encoder.encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ColorType::Rgb8,
    ) {
        Ok(()) => Some(buf.into_inner()),
        Err(e) => {
            tracing::debug!(error = %e, "jpeg encode failed");
            None
        }
    }
}

fn draw_polygon(image: &mut RgbImage, polygon: &Polygon, color: Rgb<u8>) {
    if polygon.len() < 2 {
        return;
    }
    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[(i + 1) % polygon.len()];
        draw_line_segment_mut(
            image,
            (a.x as f32, a.y as f32),
            (b.x as f32, b.y as f32),
            color,
        );
    }
}

fn draw_bbox(image: &mut RgbImage, object: &DetectedObject, color: Rgb<u8>) {
    let width = object.bbox.width().max(1.0) as u32;
    let height = object.bbox.height().max(1.0) as u32;
    let rect = Rect::at(object.bbox.x1 as i32, object.bbox.y1 as i32).of_size(width, height);
    draw_hollow_rect_mut(image, rect, color);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Point};

    fn test_frame() -> Frame {
        Frame::new(32, 32, vec![0; 32 * 32 * 3])
    }

    #[test]
    fn encodes_plain_frame() {
        let jpeg = encode_jpeg(&test_frame()).unwrap();
        // JPEG SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn encodes_annotated_frame() {
        let mut frame = test_frame();
        frame.objects.push(DetectedObject {
            label: "person".to_string(),
            confidence: 0.9,
            bbox: BoundingBox {
                x1: 2.0,
                y1: 2.0,
                x2: 20.0,
                y2: 28.0,
            },
            relevant: true,
        });

        let zones = vec![(
            vec![Point::new(0, 0), Point::new(30, 0), Point::new(30, 30)],
            true,
        )];
        let objects = frame.objects.clone();
        let spec = OverlaySpec {
            mask: &[],
            contours: None,
            zones: &zones,
            objects: &objects,
        };
        assert!(encode_annotated(&frame, &spec).is_some());
    }

    #[test]
    fn rejects_malformed_pixels() {
        let mut frame = test_frame();
        frame.pixels.truncate(10);
        assert!(encode_jpeg(&frame).is_none());
    }
}
