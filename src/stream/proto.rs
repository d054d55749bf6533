use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message timestamp as sent on the wire: RFC 3339 text or epoch number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Timestamp {
    Text(String),
    Number(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        timestamp: String,
    },
    Subscribe {
        sensor_ids: Vec<String>,
    },
    GetStatus,
}

impl ClientMessage {
    /// Heartbeat ping stamped with the current UTC time.
    pub fn ping_now() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn subscribe<I, S>(sensor_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Subscribe {
            sensor_ids: sensor_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classification of an inbound frame by its declared `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SensorData,
    Alert,
    SystemStatus,
    Pong,
    Welcome,
    Unknown,
}

impl MessageKind {
    pub fn classify(type_name: &str) -> Self {
        match type_name {
            "sensor_data" => Self::SensorData,
            "alert" => Self::Alert,
            "system_status" => Self::SystemStatus,
            "pong" => Self::Pong,
            "welcome" => Self::Welcome,
            _ => Self::Unknown,
        }
    }
}

/// Reasons an inbound frame is rejected before classification.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    /// The raw `type` discriminant, kept for logging unknown kinds.
    pub type_name: String,
    /// The nested `data` object, or the whole frame when there is none.
    pub payload: Value,
    pub timestamp: Option<Timestamp>,
}

impl InboundMessage {
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        let Value::Object(fields) = serde_json::from_str::<Value>(text)? else {
            return Err(FrameError::NotAnObject);
        };
        Self::from_fields(fields)
    }

    fn from_fields(fields: Map<String, Value>) -> Result<Self, FrameError> {
        let type_name = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();
        let timestamp = fields
            .get("timestamp")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok());
        let data = fields.get("data").filter(|data| !data.is_null()).cloned();
        let payload = data.unwrap_or_else(|| Value::Object(fields));

        Ok(Self {
            kind: MessageKind::classify(&type_name),
            type_name,
            payload,
            timestamp,
        })
    }
}

/// One sensor sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    #[serde(alias = "id")]
    pub sensor_id: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `sensor_data` payload: a single reading or a batch under `sensors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SensorData {
    Batch { sensors: Vec<SensorReading> },
    Single(SensorReading),
}

impl SensorData {
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }

    pub fn readings(&self) -> &[SensorReading] {
        match self {
            Self::Batch { sensors } => sensors,
            Self::Single(reading) => std::slice::from_ref(reading),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub auto_dismiss: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl AlertPayload {
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }

    /// Short text for display: the title, falling back to the message body.
    pub fn headline(&self) -> Option<&str> {
        self.title.as_deref().or(self.message.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_clients: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_sensors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SystemStatus {
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Greeting the server sends right after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

impl Welcome {
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}
