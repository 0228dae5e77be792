use crate::config::LabelConfig;
use crate::frame::{point_in_polygon, DetectedObject, Polygon};

/// Per-label acceptance filter for detected objects. Labels without a
/// filter are ignored entirely by the pipeline.
pub struct ObjectFilter {
    pub label: String,
    min_confidence: f32,
    width_min: f32,
    width_max: f32,
    height_min: f32,
    height_max: f32,
    pub triggers_recording: bool,
    pub post_processor: Option<String>,
    /// Only trigger a recording while motion is also detected.
    pub require_motion: bool,
    inside_any_zone: bool,
}

impl ObjectFilter {
    pub fn new(config: &LabelConfig) -> Self {
        Self {
            label: config.label.clone(),
            min_confidence: config.confidence,
            width_min: config.width_min,
            width_max: config.width_max,
            height_min: config.height_min,
            height_max: config.height_max,
            triggers_recording: config.triggers_recording,
            post_processor: config.post_processor.clone(),
            require_motion: config.require_motion,
            inside_any_zone: config.inside_any_zone,
        }
    }

    /// Confidence floor, relative-size window and (when required) a
    /// bbox-center zone membership test.
    pub fn matches(
        &self,
        object: &DetectedObject,
        frame_width: u32,
        frame_height: u32,
        zones: &[Polygon],
    ) -> bool {
        if object.confidence < self.min_confidence {
            return false;
        }

        let rel_width = object.bbox.width() / frame_width.max(1) as f32;
        let rel_height = object.bbox.height() / frame_height.max(1) as f32;
        if rel_width < self.width_min || rel_width > self.width_max {
            return false;
        }
        if rel_height < self.height_min || rel_height > self.height_max {
            return false;
        }

        if self.inside_any_zone
            && !zones
                .iter()
                .any(|zone| point_in_polygon(object.bbox.center(), zone))
        {
            return false;
        }

        true
    }
}
