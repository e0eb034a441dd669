//! Pub/Sub messaging layer
//!
//! Publishes JSON payloads to topics and consumes them from subscriptions
//! through a pluggable [`Transport`].
//!
//! ## Features
//!
//! - **Publisher**: single and batch publishes, ordering keys, optional deflate
//!   compression above a size threshold, schema validation before send
//! - **Subscribers**: poll-based and streaming consumers with handler chains,
//!   error handlers, auto-ack and nack-on-error
//! - **Formats**: plain JSON or CloudEvents 1.0 envelopes
//! - **Provisioning**: topics, subscriptions and dead-letter topics created on
//!   first use when `auto_create` is on
//! - **Queue adapter**: job push/pop/release/delete over topics
//! - **Typed events**: [`PubSubEvent`] publishing and [`EventRegistry`] dispatch
//! - **Push endpoint**: axum router for push deliveries (`webhook` feature)
//! - **Prometheus metrics**
//!
//! ## Example
//!
//! ```ignore
//! use pubsub::{FromEnv, ListenOptions, PubSubConfig, PubSubManager, PublishOptions, handler_fn};
//!
//! let manager = PubSubManager::connect(PubSubConfig::from_env()?).await?;
//!
//! manager
//!     .publisher(None)?
//!     .publish("orders", &json!({"order_id": 123}), HashMap::new(), PublishOptions::default())
//!     .await?;
//!
//! let subscriber = manager
//!     .subscriber("orders", None)?
//!     .with_handler(handler_fn("print", |m| async move { Ok(m.payload) }));
//! subscriber.listen(ListenOptions::default()).await?;
//! ```

pub mod compression;
pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod handler;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod provision;
pub mod publisher;
pub mod queue;
pub mod schema;
pub mod streaming;
pub mod subscriber;
pub mod transport;
#[cfg(feature = "webhook")]
pub mod webhook;

// Re-export main types
pub use compression::CompressionPolicy;
pub use core_config::FromEnv;
pub use config::{PubSubConfig, SubscriberMode};
pub use error::{BoxError, PubSubError, Result, TransportError, TransportErrorKind, ValidationErrors};
pub use events::{EventPublisher, EventRegistry, GenericEvent, PubSubEvent};
pub use format::{EnvelopeFormatter, EnvelopeHints, FormatterKind, MessageFormatter, PlainFormatter};
pub use handler::{ErrorContext, ErrorHandler, HandlerResult, MessageHandler, handler_fn};
pub use manager::{Connection, DEFAULT_CONNECTION, PubSubManager};
pub use message::{AttributeKey, DecodedMessage};
pub use metrics::{PubSubMetrics, init_metrics};
pub use publisher::{BatchMessage, PublishOptions, Publisher};
pub use queue::{QueueAdapter, QueueJob};
pub use schema::{SchemaSource, SchemaValidator};
pub use streaming::StreamingSubscriber;
pub use subscriber::{ListenOptions, LoopStats, MessageConsumer, StopCondition, Subscriber};
pub use transport::{InMemoryTransport, ReceivedMessage, Transport};
#[cfg(feature = "rest")]
pub use transport::{RestTransport, TokenSource};
