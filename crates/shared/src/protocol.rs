//! Wire protocol of the messaging hub: JSON frames over one WebSocket,
//! each frame terminated by the 0x1e record separator. Negotiation is
//! skipped; the handshake happens in-band right after connect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::DealId;

/// Terminates every frame, handshake included.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Client→server invocation targets.
pub const SEND_TO: &str = "SendTo";
pub const GET_MESSAGE_HISTORY: &str = "GetMessageHistory";

/// Server→client invocation targets.
pub const GET_MESSAGE: &str = "GetMessage";
pub const MESSAGE_HISTORY: &str = "MessageHistory";
pub const HUB_ERROR: &str = "Error";

pub mod frame_kind {
    pub const INVOCATION: u8 = 1;
    pub const COMPLETION: u8 = 3;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u8,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: "json".into(),
            version: 1,
        }
    }
}

/// `{}` on success, `{"error": "..."}` on rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubFrame {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

impl HubFrame {
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            kind: frame_kind::INVOCATION,
            target: Some(target.into()),
            arguments: Some(arguments),
            invocation_id: None,
            error: None,
            allow_reconnect: None,
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: frame_kind::PING,
            target: None,
            arguments: None,
            invocation_id: None,
            error: None,
            allow_reconnect: None,
        }
    }
}

/// The `SendTo` argument shape; the hub expects PascalCase fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessageDto {
    pub deal_id: DealId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_system: Option<bool>,
}

pub fn encode_handshake() -> Result<String, serde_json::Error> {
    let mut encoded = serde_json::to_string(&HandshakeRequest::default())?;
    encoded.push(RECORD_SEPARATOR);
    Ok(encoded)
}

pub fn encode_frame(frame: &HubFrame) -> Result<String, serde_json::Error> {
    let mut encoded = serde_json::to_string(frame)?;
    encoded.push(RECORD_SEPARATOR);
    Ok(encoded)
}

/// One WebSocket text message may batch several frames; a frame never
/// spans messages. Empty trailing segments are dropped.
pub fn split_frames(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|segment| !segment.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_round_trips_with_separator() {
        let frame = HubFrame::invocation(GET_MESSAGE_HISTORY, vec![json!(7), json!(1), json!(50)]);
        let encoded = encode_frame(&frame).expect("encode");
        assert!(encoded.ends_with(RECORD_SEPARATOR));

        let decoded: HubFrame =
            serde_json::from_str(encoded.trim_end_matches(RECORD_SEPARATOR)).expect("decode");
        assert_eq!(decoded.kind, frame_kind::INVOCATION);
        assert_eq!(decoded.target.as_deref(), Some(GET_MESSAGE_HISTORY));
        assert_eq!(decoded.arguments.expect("args").len(), 3);
    }

    #[test]
    fn splits_batched_frames_and_drops_empty_segments() {
        let payload = format!(
            "{}\u{1e}{}\u{1e}",
            json!({"type": 6}),
            json!({"type": 1, "target": "GetMessage", "arguments": [{"text": "hi"}]}),
        );
        let frames: Vec<&str> = split_frames(&payload).collect();
        assert_eq!(frames.len(), 2);

        let second: HubFrame = serde_json::from_str(frames[1]).expect("decode");
        assert_eq!(second.target.as_deref(), Some(GET_MESSAGE));
    }

    #[test]
    fn handshake_rejection_carries_error() {
        let response: HandshakeResponse =
            serde_json::from_str(r#"{"error":"unsupported protocol"}"#).expect("decode");
        assert_eq!(response.error.as_deref(), Some("unsupported protocol"));

        let ok: HandshakeResponse = serde_json::from_str("{}").expect("decode");
        assert!(ok.error.is_none());
    }

    #[test]
    fn send_to_dto_uses_pascal_case() {
        let dto = ChatMessageDto {
            deal_id: DealId(42),
            text: "готово".into(),
            is_system: Some(true),
        };
        let value = serde_json::to_value(&dto).expect("serialize");
        assert_eq!(value["DealId"], json!(42));
        assert_eq!(value["Text"], json!("готово"));
        assert_eq!(value["IsSystem"], json!(true));
    }
}
