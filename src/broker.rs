use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Bound on in-flight publications. The broker client drains the receiver
/// and is responsible for reconnection and its own buffering.
const PUBLISH_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct PublishItem {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Best-effort handle onto the broker publish queue. Ordering is preserved
/// per topic; a full queue drops the new item.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<PublishItem>,
}

impl Publisher {
    pub fn channel() -> (Publisher, mpsc::Receiver<PublishItem>) {
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        (Publisher { tx }, rx)
    }

    pub fn publish(&self, topic: impl Into<String>, payload: Vec<u8>) {
        let item = PublishItem {
            topic: topic.into(),
            payload,
        };
        if let Err(e) = self.tx.try_send(item) {
            tracing::debug!(error = %e, "publish queue full, dropping item");
        }
    }

    pub fn publish_json(&self, topic: impl Into<String>, value: &Value) {
        match serde_json::to_vec(value) {
            Ok(payload) => self.publish(topic, payload),
            Err(e) => tracing::debug!(error = %e, "failed to serialize payload"),
        }
    }
}

fn state_payload(state: &str, attributes: Value) -> Value {
    json!({ "state": state, "attributes": attributes })
}

/// Boolean topic with change detection: a publish is issued only when the
/// state or its attributes differ from the previous publication.
pub struct BinarySensor {
    topic: String,
    publisher: Publisher,
    last: Option<(bool, Value)>,
}

impl BinarySensor {
    pub fn new(publisher: Publisher, mqtt_name: &str, name: &str) -> Self {
        Self {
            topic: format!("{mqtt_name}/{name}"),
            publisher,
            last: None,
        }
    }

    pub fn publish(&mut self, state: bool, attributes: Value) {
        if self
            .last
            .as_ref()
            .is_some_and(|(s, a)| *s == state && *a == attributes)
        {
            return;
        }

        let payload = state_payload(if state { "on" } else { "off" }, attributes.clone());
        self.publisher.publish_json(&self.topic, &payload);
        self.last = Some((state, attributes));
    }
}

/// Camera status as published to the broker, in order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Unknown,
    Recording,
    ScanningForObjects,
    ScanningForMotion,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Unknown => "unknown",
            StatusState::Recording => "recording",
            StatusState::ScanningForObjects => "scanning_for_objects",
            StatusState::ScanningForMotion => "scanning_for_motion",
        }
    }
}

/// Status topic published only when the state or attributes change.
pub struct StatusSensor {
    topic: String,
    publisher: Publisher,
    last: Option<(StatusState, Value)>,
}

impl StatusSensor {
    pub fn new(publisher: Publisher, mqtt_name: &str) -> Self {
        Self {
            topic: format!("{mqtt_name}/sensor/status"),
            publisher,
            last: None,
        }
    }

    pub fn publish(&mut self, state: StatusState, attributes: Value) {
        if self
            .last
            .as_ref()
            .is_some_and(|(s, a)| *s == state && *a == attributes)
        {
            return;
        }

        let payload = state_payload(state.as_str(), attributes.clone());
        self.publisher.publish_json(&self.topic, &payload);
        self.last = Some((state, attributes));
    }

    pub fn state(&self) -> Option<StatusState> {
        self.last.as_ref().map(|(s, _)| *s)
    }
}

/// JPEG snapshot topic. Published every supervisor iteration when enabled,
/// without change detection.
pub struct CameraImage {
    topic: String,
    publisher: Publisher,
}

impl CameraImage {
    pub fn new(publisher: Publisher, mqtt_name: &str) -> Self {
        Self {
            topic: format!("{mqtt_name}/camera"),
            publisher,
        }
    }

    pub fn publish(&self, jpeg: Vec<u8>) {
        self.publisher.publish(&self.topic, jpeg);
    }
}

/// Topic the broker client subscribes to for camera on/off commands.
pub fn switch_command_topic(mqtt_name: &str) -> String {
    format!("{mqtt_name}/switch/set")
}
