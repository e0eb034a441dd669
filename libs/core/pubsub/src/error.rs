//! Error types for publishing and consuming.
//!
//! Errors fall in two groups:
//! - **Publish path** (`Configuration`, `Publish`, `SchemaValidation`, `Format`):
//!   always returned to the immediate caller.
//! - **Consume path** (`Format`, `Decompression`, `Handler`, `Subscription`):
//!   routed to the subscriber's error handler, never out of the pull/stream loop.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Boxed error cause carried by `Publish`, `Subscription` and `Handler`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used across the crate.
pub type Result<T, E = PubSubError> = std::result::Result<T, E>;

/// Broad classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Topic or subscription does not exist
    NotFound,
    /// Create raced with another creator
    AlreadyExists,
    /// Service unreachable or returned a 5xx
    Unavailable,
    /// Call did not complete in time
    Timeout,
    /// Credentials rejected
    PermissionDenied,
    /// Anything else
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::NotFound => write!(f, "not_found"),
            TransportErrorKind::AlreadyExists => write!(f, "already_exists"),
            TransportErrorKind::Unavailable => write!(f, "unavailable"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::PermissionDenied => write!(f, "permission_denied"),
            TransportErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Error returned by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AlreadyExists, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == TransportErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == TransportErrorKind::AlreadyExists
    }
}

/// Schema violations keyed by property path (`$` for the document root).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message against a property path.
    pub fn add(&mut self, property: impl Into<String>, message: impl Into<String>) {
        self.0.entry(property.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of offending properties.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, property: &str) -> Option<&[String]> {
        self.0.get(property).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<String>> {
        self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (property, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", property, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl serde::Serialize for ValidationErrors {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Errors raised by the messaging layer.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Missing project id, unreadable key file, schema that cannot be loaded
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport publish failure or missing message id
    #[error("publish error: {message}")]
    Publish {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Subscription creation without topic, pull/ack failure
    #[error("subscription error: {message}")]
    Subscription {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Payload does not satisfy the topic's schema
    #[error("schema validation failed for '{schema}': {errors}")]
    SchemaValidation {
        schema: String,
        errors: ValidationErrors,
    },

    /// Payload bytes could not be formatted or parsed
    #[error("format error: {0}")]
    Format(String),

    /// Payload could not be deflated
    #[error("compression error: {0}")]
    Compression(String),

    /// Compressed payload is corrupt or truncated
    #[error("decompression error: {0}")]
    Decompression(String),

    /// Queue job body could not be produced
    #[error("message conversion error: {0}")]
    MessageConversion(String),

    /// A message handler failed
    #[error("handler error: {message}")]
    Handler {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Raw transport failure outside publish/subscribe wrapping
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl PubSubError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
            source: None,
        }
    }

    pub fn publish_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Publish {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::Subscription {
            message: message.into(),
            source: None,
        }
    }

    pub fn subscription_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Subscription {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Failure returned by the handler called `name`.
    pub fn handler(name: &str, source: BoxError) -> Self {
        Self::Handler {
            message: format!("handler '{}' failed: {}", name, source),
            source: Some(source),
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PubSubError::Configuration(_) => "configuration",
            PubSubError::Publish { .. } => "publish",
            PubSubError::Subscription { .. } => "subscription",
            PubSubError::SchemaValidation { .. } => "schema_validation",
            PubSubError::Format(_) => "format",
            PubSubError::Compression(_) => "compression",
            PubSubError::Decompression(_) => "decompression",
            PubSubError::MessageConversion(_) => "message_conversion",
            PubSubError::Handler { .. } => "handler",
            PubSubError::Transport(_) => "transport",
        }
    }

    /// Structured validation detail, if this is a schema failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            PubSubError::SchemaValidation { errors, .. } => Some(errors),
            _ => None,
        }
    }

    /// Transport cause, when one is attached.
    pub fn transport_cause(&self) -> Option<&TransportError> {
        match self {
            PubSubError::Transport(e) => Some(e),
            PubSubError::Publish {
                source: Some(source),
                ..
            }
            | PubSubError::Subscription {
                source: Some(source),
                ..
            } => source.downcast_ref::<TransportError>(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        PubSubError::Format(err.to_string())
    }
}

impl From<core_config::ConfigError> for PubSubError {
    fn from(err: core_config::ConfigError) -> Self {
        PubSubError::Configuration(err.to_string())
    }
}
