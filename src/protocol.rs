use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag identifying commands sent by this client
pub const SOURCE_TAG: &str = "web_client";

/// Device HTTP endpoint names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Root,
    SetAlarmDirect,
    Button,
    Snooze,
    Reset,
    ResetSleepTimer,
}

impl Endpoint {
    /// Path segment under the device root
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Root => "",
            Endpoint::SetAlarmDirect => "setAlarmDirect",
            Endpoint::Button => "button",
            Endpoint::Snooze => "snooze",
            Endpoint::Reset => "reset",
            Endpoint::ResetSleepTimer => "resetSleepTimer",
        }
    }
}

/// Command published to the broker's command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub source: String,
}

impl CommandMessage {
    /// Create a command stamped with the current time
    pub fn new(command: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: SOURCE_TAG.to_string(),
        }
    }
}

/// Inbound broker message after JSON decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub data: Value,
}

impl Notification {
    /// Decode a raw publish payload; `None` when it is not UTF-8 JSON
    pub fn decode(topic: &str, payload: &[u8]) -> Option<Self> {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Dropping non UTF-8 message on {}: {}", topic, e);
                return None;
            }
        };

        match serde_json::from_str::<Value>(text) {
            Ok(data) => Some(Self {
                topic: topic.to_string(),
                data,
            }),
            Err(e) => {
                tracing::warn!("Error parsing message on {}: {}", topic, e);
                None
            }
        }
    }
}

/// Check an MQTT topic against a subscription filter with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
