use super::{EnvelopeHints, MessageFormatter};
use crate::error::{PubSubError, Result};
use serde_json::Value;

/// Bare JSON bodies. String payloads are sent as their raw text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl MessageFormatter for PlainFormatter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn format(&self, payload: &Value, _hints: &EnvelopeHints) -> Result<Vec<u8>> {
        match payload {
            Value::String(raw) => Ok(raw.as_bytes().to_vec()),
            other => Ok(serde_json::to_vec(other)?),
        }
    }

    fn parse(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes)
            .map_err(|e| PubSubError::Format(format!("payload is not valid JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_passes_through_unquoted() {
        let bytes = PlainFormatter
            .format(&json!(r#"{"already":"encoded"}"#), &EnvelopeHints::default())
            .unwrap();
        assert_eq!(bytes, br#"{"already":"encoded"}"#);
        assert_eq!(PlainFormatter.parse(&bytes).unwrap(), json!({ "already": "encoded" }));
    }

    #[test]
    fn test_empty_parses_to_null() {
        assert_eq!(PlainFormatter.parse(b"").unwrap(), Value::Null);
    }

    #[test]
    fn test_malformed_json_is_format_error() {
        let err = PlainFormatter.parse(b"{\"order_id\":").unwrap_err();
        assert!(matches!(err, PubSubError::Format(_)));
    }
}
