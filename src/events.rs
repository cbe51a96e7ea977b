//! Events exchanged over the [`EventBus`](crate::bus::EventBus).
//!
//! An [`Event`] is built once by its producer and never mutated afterwards.
//! The payload is a loosely-typed JSON object whose keys depend on the kind:
//!
//! | kind                | payload                                   |
//! |---------------------|-------------------------------------------|
//! | `PresenceArrived`   | `distance_cm` (optional)                  |
//! | `PresenceLeft`      | `absent_for_s` (optional)                 |
//! | `WeatherUpdated`    | `metrics`                                 |
//! | `AccessoriesNeeded` | `needed`: array of accessory names        |
//! | `CaptureRequested`  | empty                                     |
//! | `AnalysisResult`    | `image`, `summary`                        |

use crate::accessory::{Accessory, AccessorySet};
use crate::weather::WeatherMetrics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type Payload = Map<String, Value>;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PresenceArrived,
    PresenceLeft,
    WeatherUpdated,
    AccessoriesNeeded,
    CaptureRequested,
    AnalysisResult,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PresenceArrived => "presence_arrived",
            EventKind::PresenceLeft => "presence_left",
            EventKind::WeatherUpdated => "weather_updated",
            EventKind::AccessoriesNeeded => "accessories_needed",
            EventKind::CaptureRequested => "capture_requested",
            EventKind::AnalysisResult => "analysis_result",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    payload: Payload,
    source: Option<String>,
    sequence: u64,
    timestamp_ms: u64,
}

impl Event {
    pub fn new(kind: EventKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            source: None,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
        }
    }

    /// Tag the event with its producer for diagnostics.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn presence_arrived(distance_cm: Option<f32>) -> Self {
        let mut payload = Payload::new();
        if let Some(distance) = distance_cm {
            payload.insert("distance_cm".into(), json!(distance));
        }
        Self::new(EventKind::PresenceArrived, payload)
    }

    pub fn presence_left(absent_for: Option<Duration>) -> Self {
        let mut payload = Payload::new();
        if let Some(absent) = absent_for {
            payload.insert("absent_for_s".into(), json!(absent.as_secs_f64()));
        }
        Self::new(EventKind::PresenceLeft, payload)
    }

    pub fn weather_updated(metrics: &WeatherMetrics) -> Self {
        let mut payload = Payload::new();
        payload.insert(
            "metrics".into(),
            serde_json::to_value(metrics).unwrap_or_default(),
        );
        Self::new(EventKind::WeatherUpdated, payload)
    }

    pub fn accessories_needed(needed: &AccessorySet) -> Self {
        let names: Vec<Value> = needed.iter().map(|a| Value::from(a.as_str())).collect();
        let mut payload = Payload::new();
        payload.insert("needed".into(), Value::Array(names));
        Self::new(EventKind::AccessoriesNeeded, payload)
    }

    pub fn capture_requested() -> Self {
        Self::new(EventKind::CaptureRequested, Payload::new())
    }

    pub fn analysis_result(image: &str, summary: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("image".into(), json!(image));
        payload.insert("summary".into(), json!(summary));
        Self::new(EventKind::AnalysisResult, payload)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Process-wide construction order, for correlating log lines.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Decode the `needed` array of an accessories-needed event.
    ///
    /// Returns the recognised accessories and the raw entries that were not,
    /// so the caller can report them. A missing or non-array `needed` key
    /// decodes as an empty set.
    pub fn needed_accessories(&self) -> (AccessorySet, Vec<String>) {
        let mut needed = AccessorySet::new();
        let mut unknown = Vec::new();

        let Some(entries) = self.payload.get("needed").and_then(Value::as_array) else {
            return (needed, unknown);
        };

        for entry in entries {
            match entry.as_str().map(str::parse::<Accessory>) {
                Some(Ok(accessory)) => {
                    needed.insert(accessory);
                }
                Some(Err(_)) | None => unknown.push(entry.to_string()),
            }
        }

        (needed, unknown)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needed_accessories_reports_unknown_entries() {
        let mut payload = Payload::new();
        payload.insert("needed".into(), json!(["umbrella", "scarf", 7, "mask"]));
        let event = Event::new(EventKind::AccessoriesNeeded, payload);

        let (needed, unknown) = event.needed_accessories();
        assert_eq!(
            needed,
            [Accessory::Umbrella, Accessory::Mask].into_iter().collect()
        );
        assert_eq!(unknown, vec!["\"scarf\"".to_string(), "7".to_string()]);
    }

    #[test]
    fn missing_needed_key_is_empty() {
        let event = Event::new(EventKind::AccessoriesNeeded, Payload::new());
        let (needed, unknown) = event.needed_accessories();
        assert!(needed.is_empty());
        assert!(unknown.is_empty());
    }

    #[test]
    fn source_tag_is_kept() {
        let event = Event::capture_requested().with_source("actuator");
        assert_eq!(event.source(), Some("actuator"));
        assert!(event.payload().is_empty());
        assert_eq!(event.kind().to_string(), "capture_requested");
    }

    #[test]
    fn sequence_increases() {
        let first = Event::presence_arrived(None);
        let second = Event::presence_left(None);
        assert!(second.sequence() > first.sequence());
    }
}
