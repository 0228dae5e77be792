use serde_json::json;

use crate::broker::{BinarySensor, Publisher};
use crate::config::{polygon_from_config, ZoneConfig};
use crate::frame::{point_in_polygon, DetectedObject, Frame, Polygon};

/// Named polygonal sub-region with its own trigger and broker topic.
pub struct Zone {
    pub name: String,
    polygon: Polygon,
    labels: Vec<String>,
    triggers_recording: bool,
    post_processor: Option<String>,
    triggered: bool,
    sensor: BinarySensor,
}

impl Zone {
    pub fn new(config: &ZoneConfig, publisher: Publisher, mqtt_name: &str) -> Self {
        Self {
            name: config.name.clone(),
            polygon: polygon_from_config(&config.coordinates),
            labels: config.labels.clone(),
            triggers_recording: config.triggers_recording,
            post_processor: config.post_processor.clone(),
            triggered: false,
            sensor: BinarySensor::new(publisher, mqtt_name, &config.name),
        }
    }

    fn interested_in(&self, label: &str) -> bool {
        self.labels.is_empty() || self.labels.iter().any(|l| l == label)
    }

    /// Update the trigger state from the relevant objects whose bbox
    /// center lies inside the polygon. Returns the post-processor
    /// dispatches this frame produced.
    pub fn evaluate(&mut self, frame: &Frame) -> Vec<(String, DetectedObject)> {
        let mut objects_in_zone = Vec::new();
        let mut dispatches = Vec::new();

        for object in frame.objects.iter().filter(|o| o.relevant) {
            if !self.interested_in(&object.label) {
                continue;
            }
            if !point_in_polygon(object.bbox.center(), &self.polygon) {
                continue;
            }

            if let Some(post_processor) = &self.post_processor {
                dispatches.push((post_processor.clone(), object.clone()));
            }
            objects_in_zone.push(object.clone());
        }

        let triggered = !objects_in_zone.is_empty();
        if triggered != self.triggered {
            tracing::debug!(zone = %self.name, triggered, "zone trigger changed");
        }
        self.triggered = triggered;

        let attributes = json!({
            "objects": objects_in_zone
                .iter()
                .map(|o| o.formatted())
                .collect::<Vec<_>>(),
        });
        self.sensor.publish(triggered, attributes);

        dispatches
    }

    pub fn triggered(&self) -> bool {
        self.triggered
    }

    /// True when this zone currently demands a recording.
    pub fn triggers_recorder(&self) -> bool {
        self.triggered && self.triggers_recording
    }

    pub fn polygon(&self) -> &Polygon {
        &self.polygon
    }
}
