//! Wire protocol for the streaming leg
//!
//! Defines the outbound event envelope, the narrow inbound frame whitelist,
//! and the closure codes reported to the remote peer. Outbound frames use a
//! `type` tag with camelCase fields; the streaming leg is producer-only, so
//! the inbound schema is limited to liveness traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identifier extracted from a verified credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the identity
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addressable stream key: one identity plus one conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    identity: Identity,
    conversation_id: String,
}

impl Topic {
    /// Create a topic for an identity and conversation
    pub fn new(identity: Identity, conversation_id: impl Into<String>) -> Self {
        Self {
            identity,
            conversation_id: conversation_id.into(),
        }
    }

    /// Owning identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Conversation component
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{}:conv:{}", self.identity, self.conversation_id)
    }
}

/// Task lifecycle status carried by `status` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Started,
    Processing,
    Thinking,
    Streaming,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Processing => write!(f, "processing"),
            Self::Thinking => write!(f, "thinking"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outbound event delivered to stream subscribers
///
/// Immutable once constructed. `system` is the only variant the gateway
/// originates itself; everything else comes from the task executor through
/// the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task status update
    #[serde(rename_all = "camelCase")]
    Status {
        identity: Identity,
        conversation_id: String,
        status: TaskStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Incremental progress payload
    #[serde(rename_all = "camelCase")]
    Frame {
        identity: Identity,
        conversation_id: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Terminal successful result
    #[serde(rename_all = "camelCase")]
    Response {
        identity: Identity,
        conversation_id: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Human-readable failure description
    #[serde(rename_all = "camelCase")]
    Error {
        identity: Identity,
        conversation_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Connection lifecycle notice, gateway-originated
    #[serde(rename_all = "camelCase")]
    System {
        identity: Identity,
        conversation_id: String,
        status: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Build a `status` event
    pub fn status(topic: &Topic, status: TaskStatus, message: impl Into<String>) -> Self {
        Self::Status {
            identity: topic.identity().clone(),
            conversation_id: topic.conversation_id().to_string(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Build a `frame` event
    pub fn frame(topic: &Topic, payload: serde_json::Value) -> Self {
        Self::Frame {
            identity: topic.identity().clone(),
            conversation_id: topic.conversation_id().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build a `response` event
    pub fn response(topic: &Topic, payload: serde_json::Value) -> Self {
        Self::Response {
            identity: topic.identity().clone(),
            conversation_id: topic.conversation_id().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build an `error` event
    pub fn error(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Error {
            identity: topic.identity().clone(),
            conversation_id: topic.conversation_id().to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Build a `system` event
    pub fn system(topic: &Topic, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self::System {
            identity: topic.identity().clone(),
            conversation_id: topic.conversation_id().to_string(),
            status: status.into(),
            message: message.into(),
            client_timestamp: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a `system` event echoing a client-supplied timestamp
    pub fn system_echo(
        topic: &Topic,
        status: impl Into<String>,
        message: impl Into<String>,
        client_timestamp: Option<serde_json::Value>,
    ) -> Self {
        Self::System {
            identity: topic.identity().clone(),
            conversation_id: topic.conversation_id().to_string(),
            status: status.into(),
            message: message.into(),
            client_timestamp,
            timestamp: Utc::now(),
        }
    }

    /// Wire tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Frame { .. } => "frame",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::System { .. } => "system",
        }
    }
}

/// Inbound frame accepted while streaming
///
/// The whitelist is deliberately closed: the gateway never accepts
/// application commands over the streaming leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Connection health check; the optional timestamp is echoed back
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<serde_json::Value>,
    },
    /// Keep-alive with no payload
    Heartbeat,
}

/// Why an inbound frame was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame exceeds the configured size limit
    Oversized(usize),
    /// Frame is not valid JSON or lacks a `type` tag
    Malformed(String),
    /// Discriminant outside the ping/heartbeat whitelist
    Unsupported(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversized(len) => write!(f, "frame of {} bytes exceeds limit", len),
            Self::Malformed(detail) => write!(f, "malformed frame: {}", detail),
            Self::Unsupported(kind) => {
                write!(f, "message type '{}' not supported in producer-only mode", kind)
            }
        }
    }
}

impl InboundFrame {
    /// Parse an inbound text frame against the whitelist
    pub fn parse(text: &str, max_bytes: usize) -> std::result::Result<Self, FrameError> {
        if text.len() > max_bytes {
            return Err(FrameError::Oversized(text.len()));
        }

        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| FrameError::Malformed("missing type tag".to_string()))?;

        match kind {
            "ping" | "heartbeat" => serde_json::from_value(value)
                .map_err(|e| FrameError::Malformed(e.to_string())),
            other => Err(FrameError::Unsupported(other.to_string())),
        }
    }
}

/// Closure condition reported to the remote peer
///
/// Custom 4xxx values mirror the HTTP status they correspond to; 1000 and
/// 1008 are the standard WebSocket codes. The code is precise enough for
/// the peer to decide whether reconnecting is sensible (rate-limited: yes,
/// forbidden: no).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Graceful close
    Normal,
    /// Inbound frame outside the whitelist
    PolicyViolation,
    /// Missing or malformed identity, conversation, or credential parameter
    BadRequest,
    /// Credential invalid, expired, or unverifiable
    Unauthorized,
    /// Credential verified but identity differs from the path claim
    Forbidden,
    /// Upgrade origin not in the allowed list
    OriginDenied,
    /// Concurrency cap exceeded for the identity
    RateLimited,
}

impl CloseReason {
    /// WebSocket close code sent to the peer
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::PolicyViolation => 1008,
            Self::BadRequest => 4000,
            Self::Unauthorized => 4001,
            Self::Forbidden => 4003,
            Self::OriginDenied => 4403,
            Self::RateLimited => 4429,
        }
    }

    /// Short reason string carried in the close frame
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::PolicyViolation => "policy violation",
            Self::BadRequest => "bad request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::OriginDenied => "origin not allowed",
            Self::RateLimited => "rate limited",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        Topic::new(Identity::new("user-1"), "conv-1")
    }

    #[test]
    fn test_topic_display() {
        assert_eq!(topic().to_string(), "user:user-1:conv:conv-1");
    }

    #[test]
    fn test_status_event_serialization() {
        let event = Event::status(&topic(), TaskStatus::Processing, "working");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"status\":\"processing\""));
        assert!(json.contains("\"identity\":\"user-1\""));
        assert!(json.contains("\"conversationId\":\"conv-1\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_response_event_round_trip() {
        let event = Event::response(&topic(), serde_json::json!({"text": "done"}));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        match parsed {
            Event::Response { payload, conversation_id, .. } => {
                assert_eq!(payload["text"], "done");
                assert_eq!(conversation_id, "conv-1");
            }
            other => panic!("expected response event, got {:?}", other),
        }
    }

    #[test]
    fn test_system_event_omits_absent_echo() {
        let event = Event::system(&topic(), "connected", "WebSocket connection established");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"system\""));
        assert!(!json.contains("clientTimestamp"));

        let echoed = Event::system_echo(&topic(), "pong", "", Some(serde_json::json!(1234)));
        let json = serde_json::to_string(&echoed).unwrap();
        assert!(json.contains("\"clientTimestamp\":1234"));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(Event::status(&topic(), TaskStatus::Started, "").kind(), "status");
        assert_eq!(Event::frame(&topic(), serde_json::json!({})).kind(), "frame");
        assert_eq!(Event::error(&topic(), "boom").kind(), "error");
    }

    #[test]
    fn test_inbound_ping_with_timestamp() {
        let frame = InboundFrame::parse(r#"{"type":"ping","timestamp":"2026-01-01T00:00:00Z"}"#, 512)
            .unwrap();
        match frame {
            InboundFrame::Ping { timestamp } => {
                assert_eq!(timestamp, Some(serde_json::json!("2026-01-01T00:00:00Z")));
            }
            other => panic!("expected ping, got {:?}", other),
        }
    }

    #[test]
    fn test_inbound_heartbeat() {
        let frame = InboundFrame::parse(r#"{"type":"heartbeat"}"#, 512).unwrap();
        assert_eq!(frame, InboundFrame::Heartbeat);
    }

    #[test]
    fn test_inbound_rejects_unsupported_discriminant() {
        let err = InboundFrame::parse(r#"{"type":"subscribe","topics":["a"]}"#, 512).unwrap_err();
        assert_eq!(err, FrameError::Unsupported("subscribe".to_string()));
    }

    #[test]
    fn test_inbound_rejects_malformed() {
        assert!(matches!(
            InboundFrame::parse("not json", 512),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"no_type":true}"#, 512),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_inbound_rejects_oversized() {
        let big = format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(600));
        assert!(matches!(
            InboundFrame::parse(&big, 512),
            Err(FrameError::Oversized(_))
        ));
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::PolicyViolation.code(), 1008);
        assert_eq!(CloseReason::BadRequest.code(), 4000);
        assert_eq!(CloseReason::Unauthorized.code(), 4001);
        assert_eq!(CloseReason::Forbidden.code(), 4003);
        assert_eq!(CloseReason::OriginDenied.code(), 4403);
        assert_eq!(CloseReason::RateLimited.code(), 4429);
    }
}
