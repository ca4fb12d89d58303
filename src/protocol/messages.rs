//! Payload codec and control message envelope
//!
//! Every frame on the broker is a compact UTF-8 JSON document. Control
//! messages wrap the command fields in a fixed envelope.

use serde_json::{Map, Value};
use thiserror::Error;

/// Decoded message payload
pub type Payload = Value;

/// Longest payload excerpt carried in a [`DecodeError`]
const PREVIEW_LEN: usize = 120;

/// Payload could not be decoded as JSON
#[derive(Debug, Error)]
#[error("Malformed payload ({preview}): {source}")]
pub struct DecodeError {
    pub preview: String,
    #[source]
    pub source: serde_json::Error,
}

/// Decode a frame payload (pure function)
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError {
        preview: preview(bytes),
        source,
    })
}

/// Encode a payload for the wire (pure function)
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(payload)
}

/// Lossy, truncated rendering of raw bytes for logs
pub fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

/// Builder for the MirAIe control envelope
///
/// ```
/// use miraie_mqtt::protocol::ControlPayload;
///
/// let payload = ControlPayload::new().field("ps", "on").build();
/// assert_eq!(payload["ki"], 1);
/// assert_eq!(payload["ps"], "on");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPayload {
    fields: Map<String, Value>,
}

impl ControlPayload {
    pub fn new() -> Self {
        let mut fields = Map::new();
        fields.insert("ki".to_string(), Value::from(1));
        fields.insert("cnt".to_string(), Value::from("an"));
        fields.insert("sid".to_string(), Value::from("1"));
        Self { fields }
    }

    /// Add or replace one command field
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parse a `key=value` assignment. Values that parse as JSON keep their
    /// JSON type, anything else is sent as a string.
    pub fn assignment(self, assignment: &str) -> Result<Self, String> {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| format!("Expected key=value, got '{assignment}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Missing key in '{assignment}'"));
        }

        let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::from(raw.trim()));
        Ok(self.field(key, value))
    }

    pub fn build(self) -> Payload {
        Value::Object(self.fields)
    }
}

impl Default for ControlPayload {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_valid_payload() {
        let payload = decode_payload(br#"{"ps":"on","actmp":"24.0"}"#).unwrap();
        assert_eq!(payload, json!({"ps": "on", "actmp": "24.0"}));
    }

    #[test]
    fn test_decode_malformed_payload_keeps_preview() {
        let err = decode_payload(b"{not json").unwrap_err();
        assert_eq!(err.preview, "{not json");
        assert!(err.to_string().contains("Malformed payload"));
    }

    #[test]
    fn test_decode_empty_payload_fails() {
        assert!(decode_payload(b"").is_err());
    }

    #[test]
    fn test_decode_invalid_utf8_fails() {
        assert!(decode_payload(&[0xff, 0xfe, 0x7b]).is_err());
    }

    #[test]
    fn test_preview_truncates_long_payloads() {
        let long = "x".repeat(500);
        let rendered = preview(long.as_bytes());
        assert!(rendered.ends_with("..."));
        assert_eq!(rendered.chars().count(), PREVIEW_LEN + 3);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let text = "é".repeat(PREVIEW_LEN + 10);
        let rendered = preview(text.as_bytes());
        assert!(rendered.starts_with('é'));
    }

    #[test]
    fn test_control_payload_envelope() {
        let payload = ControlPayload::new()
            .field("ps", "off")
            .field("acmd", "cool")
            .build();

        assert_eq!(
            payload,
            json!({"ki": 1, "cnt": "an", "sid": "1", "ps": "off", "acmd": "cool"})
        );
    }

    #[test]
    fn test_control_payload_assignments() {
        let payload = ControlPayload::new()
            .assignment("actmp=24.0")
            .unwrap()
            .assignment("acfs=auto")
            .unwrap()
            .assignment("acvs = 2")
            .unwrap()
            .build();

        assert_eq!(payload["actmp"], json!(24.0));
        assert_eq!(payload["acfs"], json!("auto"));
        assert_eq!(payload["acvs"], json!(2));
    }

    #[test]
    fn test_control_payload_assignment_requires_key() {
        assert!(ControlPayload::new().assignment("no-equals").is_err());
        assert!(ControlPayload::new().assignment("=value").is_err());
    }

    #[test]
    fn test_encode_round_trip_preserves_structure() {
        let payload = json!({"ps": "on"});
        let bytes = encode_payload(&payload).unwrap();
        assert_eq!(decode_payload(&bytes).unwrap(), payload);
    }
}
