//! Wire format spoken with agents.
//!
//! Every WebSocket text frame is a JSON envelope
//! `{"type": <kind>, "timestamp": <rfc3339>, "data": {...}}`. The bridge sends
//! `chat_message` requests and answers agent `ping` frames; agents send
//! `chat_message` replies (solicited or not), `status` and `error` reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map, Value};

/// Envelope `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    ChatMessage,
    Ping,
    Pong,
    Status,
    Error,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Status => "status",
            Self::Error => "error",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "chat_message" => Some(Self::ChatMessage),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "status" => Some(Self::Status),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "type", default = "default_sender_type")]
    pub kind: String,
}

fn default_sender_type() -> String {
    "contact".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    pub channel: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub additional_attributes: Map<String, Value>,
}

/// A customer message forwarded to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Correlation key. The agent echoes it on the reply.
    pub message_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub inbox_id: String,
    #[serde(deserialize_with = "number_or_string")]
    pub conversation_id: i64,
    pub content: String,
    pub sender: MessageSender,
    pub context: MessageContext,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model_version: Option<String>,
}

/// An agent's reply, or an unsolicited message pushed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub inbox_id: String,
    #[serde(deserialize_with = "number_or_string")]
    pub conversation_id: i64,
    pub content: String,
    #[serde(default)]
    pub response_type: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Self-reported agent state. Logged, never acted on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub load_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default = "default_true")]
    pub recoverable: bool,
    #[serde(default)]
    pub context: Option<Value>,
}

/// A decoded frame received from an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Chat(ChatResponse),
    Ping(Value),
    Pong(Value),
    Status(StatusReport),
    Error(ErrorReport),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("unknown frame type {0:?}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: FrameKind,
    timestamp: DateTime<Utc>,
    data: &'a T,
}

/// Serialize `data` inside an envelope of the given kind.
pub fn encode_frame<T: Serialize>(kind: FrameKind, data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        kind,
        timestamp: Utc::now(),
        data,
    })
}

pub fn decode_frame(text: &str) -> Result<InboundFrame, DecodeError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(DecodeError::Envelope)?;
    let kind = FrameKind::parse(&raw.kind).ok_or(DecodeError::UnknownKind(raw.kind))?;
    let payload = |source| DecodeError::Payload {
        kind: kind.as_str(),
        source,
    };
    Ok(match kind {
        FrameKind::ChatMessage => {
            InboundFrame::Chat(serde_json::from_value(raw.data).map_err(payload)?)
        }
        FrameKind::Ping => InboundFrame::Ping(raw.data),
        FrameKind::Pong => InboundFrame::Pong(raw.data),
        FrameKind::Status => InboundFrame::Status(serde_json::from_value(raw.data).map_err(payload)?),
        FrameKind::Error => InboundFrame::Error(serde_json::from_value(raw.data).map_err(payload)?),
    })
}

// Chatwoot ids arrive as numbers; agents written against the string schema
// send them quoted. Accept both.

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| de::Error::custom(format!("{n} is not an integer id"))),
        Value::String(s) => s.trim().parse().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!(
            "expected integer or numeric string, got {other}"
        ))),
    }
}
