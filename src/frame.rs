//! The JSON message envelope exchanged over tunnel WebSockets.
//!
//! Every message in both directions is a single UTF-8 JSON text frame of the
//! shape `{"id": ..., "type": ..., "payload": {...}}`. The `id` correlates a
//! response frame with the HTTP request that produced it; for `ping`/`pong`
//! it echoes the ping. Payload keys not listed here pass through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Closed set of frame types. Anything else deserializes to [`FrameType::Unknown`]
/// so a misbehaving client cannot fail the parse of an otherwise valid envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Ping,
    Pong,
    HttpRequest,
    HttpResponse,
    StreamStart,
    StreamChunk,
    StreamEnd,
    Error,
    #[serde(other)]
    Unknown,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::HttpRequest => "http_request",
            Self::HttpResponse => "http_response",
            Self::StreamStart => "stream_start",
            Self::StreamChunk => "stream_chunk",
            Self::StreamEnd => "stream_end",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this frame type is routed to a pending HTTP request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::HttpResponse | Self::StreamStart | Self::StreamChunk | Self::StreamEnd | Self::Error
        )
    }
}

/// The message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Frame {
    /// Build an outbound `http_request` frame.
    pub fn http_request(
        id: &str,
        method: &str,
        url: &str,
        headers: Value,
        body: String,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("method".into(), json!(method));
        payload.insert("url".into(), json!(url));
        payload.insert("headers".into(), headers);
        payload.insert("body".into(), json!(body));
        Self {
            id: id.to_string(),
            kind: FrameType::HttpRequest,
            payload,
        }
    }

    /// Build a `pong` echoing the ping's id.
    pub fn pong(ping_id: &str) -> Self {
        Self {
            id: ping_id.to_string(),
            kind: FrameType::Pong,
            payload: Map::new(),
        }
    }

    /// Payload string field, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Payload `status` field as an HTTP status number, if present.
    pub fn payload_status(&self) -> Option<u16> {
        self.payload
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::http_request(
            "req-1",
            "POST",
            "https://example.com/v1/x",
            json!({"Content-Type": ["application/json"]}),
            "{}".to_string(),
        );
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.id, "req-1");
        assert_eq!(parsed.kind, FrameType::HttpRequest);
        assert_eq!(parsed.payload_str("method"), Some("POST"));
        assert_eq!(parsed.payload_str("body"), Some("{}"));
    }

    #[test]
    fn test_unknown_type_parses() {
        let parsed: Frame =
            serde_json::from_str(r#"{"id":"x","type":"hologram","payload":{}}"#).unwrap();
        assert_eq!(parsed.kind, FrameType::Unknown);
    }

    #[test]
    fn test_missing_payload_defaults_empty() {
        let parsed: Frame = serde_json::from_str(r#"{"id":"p1","type":"ping"}"#).unwrap();
        assert_eq!(parsed.kind, FrameType::Ping);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_payload_status() {
        let parsed: Frame = serde_json::from_str(
            r#"{"id":"x","type":"http_response","payload":{"status":429}}"#,
        )
        .unwrap();
        assert_eq!(parsed.payload_status(), Some(429));
        assert!(parsed.kind.is_response());
    }

    #[test]
    fn test_pong_echoes_id() {
        let pong = Frame::pong("hb-7");
        let text = serde_json::to_string(&pong).unwrap();
        assert!(text.contains(r#""type":"pong""#));
        assert!(text.contains(r#""id":"hb-7""#));
    }
}
