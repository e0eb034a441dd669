use super::{EnvelopeHints, MessageFormatter};
use crate::error::{PubSubError, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const SPEC_VERSION: &str = "1.0";

const DATA_CONTENT_TYPE: &str = "application/json";
const REQUIRED: [&str; 4] = ["spec_version", "type", "source", "id"];

/// CloudEvents-style envelope around the payload.
#[derive(Debug, Clone)]
pub struct EnvelopeFormatter {
    default_source: String,
    default_type: String,
}

impl EnvelopeFormatter {
    pub fn new(default_source: impl Into<String>, default_type: impl Into<String>) -> Self {
        Self {
            default_source: default_source.into(),
            default_type: default_type.into(),
        }
    }

    fn is_envelope(payload: &Value) -> bool {
        payload
            .as_object()
            .is_some_and(|o| o.contains_key("spec_version") && o.contains_key("type"))
    }
}

fn explicit<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

impl MessageFormatter for EnvelopeFormatter {
    fn name(&self) -> &'static str {
        "cloud_events"
    }

    fn format(&self, payload: &Value, hints: &EnvelopeHints) -> Result<Vec<u8>> {
        if Self::is_envelope(payload) {
            return Ok(serde_json::to_vec(payload)?);
        }

        let event_type = explicit(payload, "type")
            .map(str::to_string)
            .or_else(|| hints.event_type.clone())
            .unwrap_or_else(|| self.default_type.clone());
        let id = explicit(payload, "id")
            .map(str::to_string)
            .or_else(|| hints.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let source = explicit(payload, "source")
            .map(str::to_string)
            .or_else(|| hints.source.clone())
            .unwrap_or_else(|| self.default_source.clone());
        let time = explicit(payload, "time")
            .map(str::to_string)
            .or_else(|| hints.time.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let subject = explicit(payload, "subject")
            .map(str::to_string)
            .or_else(|| hints.subject.clone());

        let mut envelope = Map::new();
        envelope.insert("spec_version".into(), Value::from(SPEC_VERSION));
        envelope.insert("type".into(), Value::from(event_type));
        envelope.insert("source".into(), Value::from(source));
        envelope.insert("id".into(), Value::from(id));
        envelope.insert("time".into(), Value::from(time));
        envelope.insert("data_content_type".into(), Value::from(DATA_CONTENT_TYPE));
        envelope.insert("data".into(), payload.clone());
        if let Some(subject) = subject {
            envelope.insert("subject".into(), Value::from(subject));
        }

        Ok(serde_json::to_vec(&Value::Object(envelope))?)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Value> {
        let envelope: Value = serde_json::from_slice(bytes)
            .map_err(|e| PubSubError::Format(format!("envelope is not valid JSON: {}", e)))?;

        let Value::Object(mut fields) = envelope else {
            return Err(PubSubError::Format("envelope must be a JSON object".into()));
        };

        let missing: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|key| fields.get(*key).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(PubSubError::Format(format!(
                "envelope is missing {}",
                missing.join(", ")
            )));
        }

        match fields.remove("data") {
            Some(data) => Ok(data),
            None => Ok(Value::Object(fields)),
        }
    }
}
