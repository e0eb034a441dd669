//! Payload formatters.
//!
//! A formatter turns a JSON payload into message bytes and back. Topics pick
//! one by name (`json` or `cloud_events`), falling back to the configured
//! default.

mod envelope;
mod plain;

pub use envelope::{EnvelopeFormatter, SPEC_VERSION};
pub use plain::PlainFormatter;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};

/// Envelope metadata offered by a typed event.
///
/// Explicit fields in the payload still take precedence; anything left
/// unset here falls back to generated defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHints {
    pub event_type: Option<String>,
    pub id: Option<String>,
    pub source: Option<String>,
    pub subject: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

impl EnvelopeHints {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Serializes payloads to bytes and back.
pub trait MessageFormatter: Send + Sync {
    fn name(&self) -> &'static str;

    fn format(&self, payload: &Value, hints: &EnvelopeHints) -> Result<Vec<u8>>;

    fn parse(&self, bytes: &[u8]) -> Result<Value>;
}

/// Registered formatter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FormatterKind {
    #[default]
    Json,
    CloudEvents,
}

impl FormatterKind {
    /// Build the formatter; `source` and `event_type` seed envelope defaults.
    pub fn build(&self, source: &str, event_type: &str) -> Arc<dyn MessageFormatter> {
        match self {
            FormatterKind::Json => Arc::new(PlainFormatter),
            FormatterKind::CloudEvents => Arc::new(EnvelopeFormatter::new(source, event_type)),
        }
    }
}
