//! Wire message codec.
//!
//! Messages are JSON objects of the shape
//! `{"type": "<string>", "data": {"<string>": "<string>", ...}}` with a
//! flat, string-typed data map.  On the socket, each message occupies one
//! line; the JSON itself never contains a raw newline because `serde_json`
//! escapes control characters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One boundary message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl WireMessage {
    pub fn new(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_string(),
            data: HashMap::new(),
        }
    }

    /// Builder-style data entry.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// A data value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the wire.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let msg = WireMessage::new("user_message")
            .with("message", "What is 2+2?")
            .with("session", "main");

        let json = msg.to_json().unwrap();
        let back = WireMessage::from_json(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn round_trip_with_escapes() {
        let msg = WireMessage::new("user_message").with("message", "line1\nline2\t\"quoted\"\\end\r");
        let json = msg.to_json().unwrap();
        // Control characters are escaped, so one message stays on one line.
        assert!(!json.contains('\n'));
        assert_eq!(WireMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn parses_external_shape() {
        let msg =
            WireMessage::from_json(r#"{"type":"switch_model","data":{"mode":"deep"}}"#).unwrap();
        assert_eq!(msg.message_type, "switch_model");
        assert_eq!(msg.get("mode"), Some("deep"));
    }

    #[test]
    fn missing_data_defaults_to_empty() {
        let msg = WireMessage::from_json(r#"{"type":"get_status"}"#).unwrap();
        assert_eq!(msg.message_type, "get_status");
        assert!(msg.data.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(WireMessage::from_json("not json at all").is_err());
        assert!(WireMessage::from_json(r#"{"data":{}}"#).is_err());
    }
}
