//! DAP message envelope.
//!
//! Every frame on the wire is one of three shapes discriminated by the
//! `type` field: a client request, an adapter response, or an adapter
//! event. Bodies stay as raw JSON here; the typed structs in
//! [`crate::types`] are applied at the handler boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Any DAP frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

/// A client-initiated request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Client sequence number, echoed back as `request_seq`.
    pub seq: i64,
    /// Command name, e.g. `"setBreakpoints"`.
    pub command: String,
    /// Command arguments; absent for argument-less requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// The adapter's answer to one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub seq: i64,
    /// The `seq` of the request being answered.
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    /// Short error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// An adapter-initiated notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: i64,
    /// Event name, e.g. `"stopped"`.
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Request {
    /// Build the success response for this request.
    pub fn success(&self, seq: i64, body: Option<Value>) -> Response {
        Response {
            seq,
            request_seq: self.seq,
            success: true,
            command: self.command.clone(),
            message: None,
            body,
        }
    }

    /// Build the error response for this request.
    pub fn error(&self, seq: i64, message: impl Into<String>) -> Response {
        Response {
            seq,
            request_seq: self.seq,
            success: false,
            command: self.command.clone(),
            message: Some(message.into()),
            body: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_round_trips_through_json() {
        let text = r#"{"seq":3,"type":"request","command":"scopes","arguments":{"frameId":0}}"#;
        let message: Message = serde_json::from_str(text).unwrap();
        let Message::Request(request) = &message else {
            panic!("expected a request");
        };
        assert_eq!(request.command, "scopes");
        assert_eq!(request.arguments, Some(json!({"frameId": 0})));

        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["type"], "request");
        assert_eq!(encoded["seq"], 3);
    }

    #[test]
    fn error_response_carries_message() {
        let request = Request {
            seq: 9,
            command: "stackTrace".to_string(),
            arguments: None,
        };
        let response = request.error(12, "not paused");
        assert!(!response.success);
        assert_eq!(response.request_seq, 9);
        assert_eq!(response.message.as_deref(), Some("not paused"));
    }

    #[test]
    fn event_without_body_omits_field() {
        let event = Message::Event(Event {
            seq: 1,
            event: "initialized".to_string(),
            body: None,
        });
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(!encoded.contains("body"));
    }
}
