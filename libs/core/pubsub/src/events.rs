//! Typed domain events.
//!
//! [`PubSubEvent`] lets a serializable type say where and how it should be
//! published. Every capability is optional; anything an event leaves unset is
//! resolved from configuration (`events.topics`, `events.default_topic`).
//!
//! On the consuming side, [`EventRegistry`] dispatches decoded messages to
//! typed handlers by their `event_type` tag.

use crate::error::{BoxError, PubSubError, Result};
use crate::format::EnvelopeHints;
use crate::handler::{HandlerResult, MessageHandler};
use crate::message::{AttributeKey, DecodedMessage};
use crate::publisher::{PublishOptions, Publisher};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A publishable event.
pub trait PubSubEvent: Serialize + Send + Sync {
    /// Explicit destination topic
    fn topic(&self) -> Option<String> {
        None
    }

    /// Extra message attributes
    fn attributes(&self) -> Option<HashMap<String, String>> {
        None
    }

    fn ordering_key(&self) -> Option<String> {
        None
    }

    /// Type tag; defaults to the Rust type name
    fn event_type(&self) -> Option<String> {
        None
    }

    fn event_id(&self) -> Option<String> {
        None
    }

    fn event_source(&self) -> Option<String> {
        None
    }

    fn event_subject(&self) -> Option<String> {
        None
    }
}

/// Publishes [`PubSubEvent`]s through a [`Publisher`].
#[derive(Clone)]
pub struct EventPublisher {
    publisher: Arc<Publisher>,
}

impl EventPublisher {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    /// Resolve the destination: the event's own topic, then the
    /// `events.topics` entry for its type, then `events.default_topic`.
    pub fn topic_for<E: PubSubEvent>(&self, event: &E) -> Result<String> {
        if let Some(topic) = event.topic() {
            return Ok(topic);
        }
        let events = &self.publisher.config().events;
        let event_type = type_tag(event);
        events
            .topics
            .get(&event_type)
            .or(events.default_topic.as_ref())
            .cloned()
            .ok_or_else(|| {
                PubSubError::configuration(format!(
                    "no topic for event '{}': set events.default_topic or map it in events.topics",
                    event_type
                ))
            })
    }

    #[instrument(skip(self, event))]
    pub async fn publish<E: PubSubEvent>(&self, event: &E) -> Result<String> {
        let topic = self.topic_for(event)?;
        let event_type = type_tag(event);
        let payload = serde_json::to_value(event)?;

        let mut attributes = event.attributes().unwrap_or_default();
        attributes
            .entry(AttributeKey::EventType.to_string())
            .or_insert_with(|| event_type.clone());

        let options = PublishOptions {
            ordering_key: event.ordering_key(),
            compress: None,
            hints: EnvelopeHints {
                event_type: Some(event_type),
                id: event.event_id(),
                source: event.event_source(),
                subject: event.event_subject(),
                time: None,
            },
        };
        self.publisher.publish(&topic, &payload, attributes, options).await
    }
}

/// Type tag for an event: its own, else the unqualified Rust type name.
fn type_tag<E: PubSubEvent>(event: &E) -> String {
    event.event_type().unwrap_or_else(|| {
        let full = std::any::type_name::<E>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    })
}

/// An event with no registered type.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericEvent {
    pub event_type: Option<String>,
    pub payload: Value,
    pub attributes: HashMap<String, String>,
}

type BoxFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type EventFn = Arc<dyn Fn(DecodedMessage) -> BoxFuture + Send + Sync>;

/// Dispatches messages to typed handlers by event type.
///
/// Unknown types go to the fallback when one is set and pass through
/// unchanged otherwise.
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: HashMap<String, EventFn>,
    fallback: Option<EventFn>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialize payloads tagged `event_type` into `T` and hand them to `f`.
    pub fn on<T, F, Fut>(mut self, event_type: impl Into<String>, f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, DecodedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: EventFn = Arc::new(move |message: DecodedMessage| -> BoxFuture {
            let f = f.clone();
            Box::pin(async move {
                let event: T = serde_json::from_value(message.payload.clone()).map_err(|e| {
                    Box::new(PubSubError::MessageConversion(format!(
                        "message {} does not match its event type: {}",
                        message.id, e
                    ))) as BoxError
                })?;
                f(event, message).await
            })
        });
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// Catch-all for types without a handler.
    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(GenericEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let f = Arc::new(f);
        self.fallback = Some(Arc::new(move |message: DecodedMessage| -> BoxFuture {
            let event = GenericEvent {
                event_type: message.event_type().map(str::to_string),
                payload: message.payload,
                attributes: message.attributes,
            };
            let f = f.clone();
            Box::pin(async move { f(event).await })
        }));
        self
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }
}

#[async_trait]
impl MessageHandler for EventRegistry {
    async fn handle(&self, message: &DecodedMessage) -> HandlerResult {
        let handler = message
            .event_type()
            .and_then(|tag| self.handlers.get(tag))
            .or(self.fallback.as_ref());

        match handler {
            Some(handler) => handler(message.clone()).await,
            None => {
                debug!(
                    message_id = %message.id,
                    event_type = ?message.event_type(),
                    "No handler for event type"
                );
                Ok(message.payload.clone())
            }
        }
    }

    fn name(&self) -> &str {
        "event_registry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PubSubConfig;
    use crate::schema::SchemaValidator;
    use crate::transport::{InMemoryTransport, Transport};
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    impl PubSubEvent for OrderPlaced {
        fn ordering_key(&self) -> Option<String> {
            Some(format!("order-{}", self.order_id))
        }
    }

    #[derive(Serialize)]
    struct AuditEntry {
        action: String,
    }

    impl PubSubEvent for AuditEntry {
        fn topic(&self) -> Option<String> {
            Some("audit".into())
        }

        fn event_type(&self) -> Option<String> {
            Some("audit.entry".into())
        }

        fn attributes(&self) -> Option<HashMap<String, String>> {
            Some(HashMap::from([("tenant".into(), "acme".into())]))
        }
    }

    fn events(config: PubSubConfig) -> (Arc<InMemoryTransport>, EventPublisher) {
        let transport = Arc::new(InMemoryTransport::new());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let publisher = Publisher::new(
            dyn_transport,
            Arc::new(config),
            Arc::new(SchemaValidator::new(false)),
        );
        (transport, EventPublisher::new(Arc::new(publisher)))
    }

    fn decoded(payload: Value, attributes: &[(&str, &str)]) -> DecodedMessage {
        DecodedMessage {
            id: "1".into(),
            ack_id: "a".into(),
            subscription: "s".into(),
            payload,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            compressed: false,
            ordering_key: None,
            publish_time: Utc::now(),
            delivery_attempt: None,
        }
    }

    #[tokio::test]
    async fn test_topic_from_type_mapping() {
        let mut config = PubSubConfig::new("acme");
        config.events.topics.insert("OrderPlaced".into(), "orders".into());
        let (transport, events) = events(config);

        events.publish(&OrderPlaced { order_id: 7 }).await.unwrap();

        let sent = transport.published("orders").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attributes["event_type"], "OrderPlaced");
        assert_eq!(sent[0].ordering_key.as_deref(), Some("order-7"));
    }

    #[tokio::test]
    async fn test_event_capabilities_win() {
        let mut config = PubSubConfig::new("acme");
        config.events.default_topic = Some("events".into());
        let (transport, events) = events(config);

        events
            .publish(&AuditEntry {
                action: "login".into(),
            })
            .await
            .unwrap();

        let sent = transport.published("audit").await;
        assert_eq!(sent[0].attributes["event_type"], "audit.entry");
        assert_eq!(sent[0].attributes["tenant"], "acme");
        assert!(transport.published("events").await.is_empty());
    }

    #[test]
    fn test_unresolvable_topic_is_configuration_error() {
        let (_, events) = events(PubSubConfig::new("acme"));
        let err = events.topic_for(&OrderPlaced { order_id: 1 }).unwrap_err();
        assert!(matches!(err, PubSubError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_attribute_tag() {
        let registry = EventRegistry::new().on("OrderPlaced", |event: OrderPlaced, _m| async move {
            Ok::<_, BoxError>(json!(event.order_id * 10))
        });

        let result = registry
            .handle(&decoded(json!({ "order_id": 4 }), &[("event_type", "OrderPlaced")]))
            .await
            .unwrap();
        assert_eq!(result, json!(40));
    }

    #[tokio::test]
    async fn test_registry_reads_payload_tag_and_reports_mismatch() {
        let registry = EventRegistry::new().on("OrderPlaced", |event: OrderPlaced, _m| async move {
            Ok::<_, BoxError>(json!(event.order_id))
        });

        let err = registry
            .handle(&decoded(json!({ "event_type": "OrderPlaced", "order_id": "x" }), &[]))
            .await
            .unwrap_err();
        let err = err.downcast_ref::<PubSubError>().expect("conversion error");
        assert_eq!(err.kind(), "message_conversion");
    }

    #[tokio::test]
    async fn test_unknown_type_goes_to_fallback_or_passes_through() {
        let payload = json!({ "event_type": "Mystery", "n": 1 });

        let plain = EventRegistry::new();
        assert_eq!(plain.handle(&decoded(payload.clone(), &[])).await.unwrap(), payload);

        let with_fallback = EventRegistry::new().fallback(|event: GenericEvent| async move {
            Ok::<_, BoxError>(json!(event.event_type))
        });
        assert!(!with_fallback.handles("Mystery"));
        assert_eq!(
            with_fallback.handle(&decoded(payload, &[])).await.unwrap(),
            json!("Mystery")
        );
    }
}
