//! Wire frames carried over the tunnel WebSocket and the public stream
//! sockets. JSON text frames with an internally-tagged `"type"` field.
//!
//! Two directions share the socket:
//!
//! - [`LaptopFrame`] — sent by the tunnel client (laptop → relay)
//! - [`RelayFrame`] — sent by the relay (relay → laptop)
//!
//! Tunnel control frames use camelCase identifiers (`requestId`,
//! `statusCode`, `sessionId`); the `AgentEvent` envelope keeps its own
//! lower-snake naming (see [`crate::event`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::event::AgentEvent;

/// Frames sent by the laptop over the tunnel WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaptopFrame {
    /// Completes the pending relayed request with the same `requestId`.
    HttpResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(default)]
        body: Value,
    },
    /// Registers the key the relay then requires from mobile clients.
    ClientAuthKey { key: String },
    /// Raw terminal bytes for one session.
    TerminalOutput {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    /// Incremental speech-transcription output for one session.
    RecordingOutput {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        #[serde(rename = "isComplete", skip_serializing_if = "Option::is_none")]
        is_complete: Option<bool>,
    },
    /// A typed envelope event; the stream key derives from
    /// `event.session_id`.
    AgentEvent { event: AgentEvent },
}

/// Frames sent by the relay over the tunnel WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// A relayed mobile-side HTTP request awaiting an `http_response`.
    HttpRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        query: HashMap<String, String>,
        #[serde(default)]
        body: Value,
    },
    /// Keystrokes from a terminal stream subscriber.
    TerminalInput {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    /// A typed envelope event originated by a mobile client.
    AgentEvent { event: AgentEvent },
    /// The relay is shutting down; reconnect immediately, skipping backoff.
    RelayShutdown,
}

/// `{type:"input", data}` sent by a terminal stream subscriber.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberFrame {
    Input { data: String },
}

/// Normalize the path forwarded to the laptop: the substring of the public
/// URL after `/api/{tunnelId}`, with double slashes collapsed and a leading
/// slash guaranteed.
pub fn normalize_path(rest: &str) -> String {
    let mut out = String::with_capacity(rest.len() + 1);
    out.push('/');
    let mut last_was_slash = true;
    for c in rest.chars() {
        if c == '/' {
            if !last_was_slash {
                out.push('/');
            }
            last_was_slash = true;
        } else {
            out.push(c);
            last_was_slash = false;
        }
    }
    // Keep "/" for the empty path but strip other trailing slashes that the
    // collapse above may have left.
    if out.len() > 1 && out.ends_with('/') && !rest.ends_with('/') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_response_wire_shape() {
        let text = json!({
            "type": "http_response",
            "requestId": "r1",
            "statusCode": 200,
            "body": {"sessions": []},
        })
        .to_string();
        let frame: LaptopFrame = serde_json::from_str(&text).unwrap();
        let LaptopFrame::HttpResponse {
            request_id,
            status_code,
            body,
        } = frame
        else {
            panic!("wrong variant");
        };
        assert_eq!(request_id, "r1");
        assert_eq!(status_code, 200);
        assert_eq!(body, json!({"sessions": []}));
    }

    #[test]
    fn test_http_request_wire_shape() {
        let frame = RelayFrame::HttpRequest {
            request_id: "r2".into(),
            method: "GET".into(),
            path: "/terminal/list".into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: Value::Null,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "http_request");
        assert_eq!(value["requestId"], "r2");
        assert_eq!(value["method"], "GET");
        assert_eq!(value["path"], "/terminal/list");
    }

    #[test]
    fn test_terminal_output_uses_camel_session_id() {
        let text = json!({
            "type": "terminal_output",
            "sessionId": "S",
            "data": "hello",
        })
        .to_string();
        let frame: LaptopFrame = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            frame,
            LaptopFrame::TerminalOutput { ref session_id, ref data }
                if session_id == "S" && data == "hello"
        ));
    }

    #[test]
    fn test_recording_output_optional_fields() {
        let text = json!({
            "type": "recording_output",
            "sessionId": "S",
            "text": "hello world",
            "delta": "world",
        })
        .to_string();
        let frame: LaptopFrame = serde_json::from_str(&text).unwrap();
        let LaptopFrame::RecordingOutput {
            raw, is_complete, ..
        } = frame
        else {
            panic!("wrong variant");
        };
        assert!(raw.is_none());
        assert!(is_complete.is_none());

        // Absent optionals stay absent on the wire.
        let value = serde_json::to_value(&LaptopFrame::RecordingOutput {
            session_id: "S".into(),
            text: "t".into(),
            delta: "d".into(),
            raw: None,
            timestamp: Some(5),
            is_complete: Some(true),
        })
        .unwrap();
        assert!(value.get("raw").is_none());
        assert_eq!(value["isComplete"], true);
    }

    #[test]
    fn test_agent_event_frame_embeds_envelope() {
        let text = json!({
            "type": "agent_event",
            "event": {
                "type": "command_text",
                "session_id": "S",
                "message_id": "m1",
                "timestamp": 1,
                "payload": {"text": "hi"},
            },
        })
        .to_string();
        let frame: LaptopFrame = serde_json::from_str(&text).unwrap();
        let LaptopFrame::AgentEvent { event } = frame else {
            panic!("wrong variant");
        };
        assert_eq!(event.session_id, "S");
        assert_eq!(event.payload.type_str(), "command_text");
    }

    #[test]
    fn test_unknown_frame_type_fails_decode() {
        let text = json!({"type": "warp_drive", "sessionId": "S"}).to_string();
        assert!(serde_json::from_str::<LaptopFrame>(&text).is_err());
    }

    #[test]
    fn test_relay_shutdown_shape() {
        let value = serde_json::to_value(&RelayFrame::RelayShutdown).unwrap();
        assert_eq!(value, json!({"type": "relay_shutdown"}));
    }

    #[test]
    fn test_subscriber_input_frame() {
        let frame: SubscriberFrame =
            serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        let SubscriberFrame::Input { data } = frame;
        assert_eq!(data, "ls\n");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("terminal/list"), "/terminal/list");
        assert_eq!(normalize_path("/terminal/list"), "/terminal/list");
        assert_eq!(normalize_path("//terminal//list"), "/terminal/list");
        assert_eq!(normalize_path("terminal/list/"), "/terminal/list/");
    }
}
