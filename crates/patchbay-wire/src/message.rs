//! Wire message types for hub-satellite communication.
//!
//! One JSON object per line, discriminated by `"t"`:
//! - **hello**: first message on a new connection, arbitration only
//! - **call**: hub-issued request
//! - **response**: satellite reply, correlated by `id`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Peer identity and session timestamp, sent once per connection.
///
/// Never retransmitted on the same connection; the hub records it for
/// arbitration against later arrivals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "timeUtc")]
    pub time_utc: DateTime<Utc>,
}

/// Tagged union of everything that crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum Message {
    Hello(Hello),

    Call {
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },

    Response {
        id: String,
        result: ResultEnvelope,
    },
}

/// Result shape carried by every `response` message.
///
/// This is the only error surface visible outside the core: timeouts,
/// channel loss, unknown handlers and handler panics all arrive as an
/// envelope with `is_error = true`. The core never interprets `content`
/// beyond passing it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

impl ResultEnvelope {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: true,
        }
    }

    /// Concatenated text of all content items, for logging and tests.
    pub fn text_joined(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn hello_wire_shape() {
        let msg = Message::Hello(Hello {
            peer_id: "peer-1".to_string(),
            time_utc: test_time(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "t": "hello",
                "peerId": "peer-1",
                "timeUtc": "2024-05-01T12:30:00Z",
            })
        );
    }

    #[test]
    fn call_wire_shape() {
        let msg = Message::Call {
            id: "42".to_string(),
            name: "scene.load".to_string(),
            args: json!({"path": "Main.unity"}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "t": "call",
                "id": "42",
                "name": "scene.load",
                "args": {"path": "Main.unity"},
            })
        );
    }

    #[test]
    fn response_wire_shape() {
        let msg = Message::Response {
            id: "42".to_string(),
            result: ResultEnvelope::text("ok"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "t": "response",
                "id": "42",
                "result": {
                    "content": [{"type": "text", "text": "ok"}],
                    "isError": false,
                },
            })
        );
    }

    #[test]
    fn call_without_args_defaults_to_null() {
        let msg: Message =
            serde_json::from_str(r#"{"t":"call","id":"1","name":"ping"}"#).unwrap();
        match msg {
            Message::Call { id, name, args } => {
                assert_eq!(id, "1");
                assert_eq!(name, "ping");
                assert_eq!(args, serde_json::Value::Null);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn missing_discriminator_fails_to_parse() {
        let result: Result<Message, _> = serde_json::from_str(r#"{"id":"1","name":"ping"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_discriminator_fails_to_parse() {
        let result: Result<Message, _> = serde_json::from_str(r#"{"t":"stream","id":"1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn error_envelope() {
        let env = ResultEnvelope::error("call timed out after 8000ms");
        assert!(env.is_error);
        assert_eq!(env.text_joined(), "call timed out after 8000ms");
    }

    #[test]
    fn hello_timestamp_roundtrips() {
        let hello = Hello {
            peer_id: "p".to_string(),
            time_utc: test_time(),
        };
        let json = serde_json::to_string(&hello).unwrap();
        let parsed: Hello = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hello);
    }
}
