//! Application-level view of a pulled message.

use crate::compression::{self, COMPRESSION_TYPE};
use crate::error::{PubSubError, Result};
use crate::format::MessageFormatter;
use crate::transport::ReceivedMessage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use strum::{AsRefStr, Display, EnumString};

/// Attribute keys written or read by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AttributeKey {
    Compressed,
    CompressionType,
    OrderingKey,
    PublishedAt,
    Publisher,
    Hostname,
    AppName,
    DeliverAfter,
    DeliveryAttempt,
    EventType,
}

impl AttributeKey {
    /// Keys owned by the publisher; caller values are discarded.
    pub const RESERVED: [AttributeKey; 3] = [
        AttributeKey::Compressed,
        AttributeKey::CompressionType,
        AttributeKey::OrderingKey,
    ];

    pub fn is_reserved(key: &str) -> bool {
        Self::RESERVED.iter().any(|reserved| reserved.as_ref() == key)
    }
}

/// A pulled message after decompression and format parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub id: String,
    pub ack_id: String,
    pub subscription: String,
    pub payload: Value,
    pub attributes: HashMap<String, String>,
    pub compressed: bool,
    pub ordering_key: Option<String>,
    pub publish_time: DateTime<Utc>,
    pub delivery_attempt: Option<u32>,
}

impl DecodedMessage {
    pub fn attribute(&self, key: AttributeKey) -> Option<&str> {
        self.attributes.get(key.as_ref()).map(String::as_str)
    }

    /// Type tag from the `event_type` attribute, else the payload field.
    pub fn event_type(&self) -> Option<&str> {
        self.attribute(AttributeKey::EventType)
            .or_else(|| self.payload.get("event_type").and_then(Value::as_str))
    }
}

/// Whether the `compressed` attribute flags the body.
pub fn is_compressed(attributes: &HashMap<String, String>) -> bool {
    attributes
        .get(AttributeKey::Compressed.as_ref())
        .is_some_and(|v| v == "true" || v == "1")
}

/// Raw payload bytes, inflated when the message is flagged compressed.
pub fn body(message: &ReceivedMessage) -> Result<Vec<u8>> {
    if !is_compressed(&message.attributes) {
        return Ok(message.data.clone());
    }
    if let Some(kind) = message.attributes.get(AttributeKey::CompressionType.as_ref())
        && kind != COMPRESSION_TYPE
    {
        return Err(PubSubError::Decompression(format!(
            "unsupported compression type '{}'",
            kind
        )));
    }
    compression::decompress(&message.data)
}

/// Decompress then parse a pulled message.
pub fn decode(
    message: &ReceivedMessage,
    subscription: &str,
    formatter: &dyn MessageFormatter,
) -> Result<DecodedMessage> {
    let bytes = body(message)?;
    let payload = formatter.parse(&bytes)?;

    Ok(DecodedMessage {
        id: message.id.clone(),
        ack_id: message.ack_id.clone(),
        subscription: subscription.to_string(),
        payload,
        attributes: message.attributes.clone(),
        compressed: is_compressed(&message.attributes),
        ordering_key: message.ordering_key.clone(),
        publish_time: message.publish_time,
        delivery_attempt: message.delivery_attempt,
    })
}

/// Host name reported in the `hostname` attribute.
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string())
    })
}
