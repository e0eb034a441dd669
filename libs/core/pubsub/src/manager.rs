//! Named connections and the components built on them.
//!
//! A [`PubSubManager`] is created once at start-up and passed around
//! explicitly. Each connection pairs a transport with its configuration;
//! publishers and queue adapters are created on first use and shared,
//! subscribers are handed out fresh because they own their handler chains.

use crate::config::{PubSubConfig, SubscriberMode};
use crate::error::{PubSubError, Result};
use crate::events::EventPublisher;
use crate::publisher::Publisher;
use crate::queue::QueueAdapter;
use crate::schema::SchemaValidator;
use crate::streaming::StreamingSubscriber;
use crate::subscriber::{MessageConsumer, Subscriber};
use crate::transport::Transport;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::watch;
use tracing::info;

/// Name used when a caller does not pick a connection.
pub const DEFAULT_CONNECTION: &str = "default";

/// One transport plus its configuration.
pub struct Connection {
    name: String,
    transport: Arc<dyn Transport>,
    config: Arc<PubSubConfig>,
    validator: Arc<SchemaValidator>,
    publisher: OnceLock<Arc<Publisher>>,
    queue: OnceLock<Arc<QueueAdapter>>,
}

impl Connection {
    fn new(name: String, transport: Arc<dyn Transport>, config: PubSubConfig) -> Self {
        Self {
            validator: Arc::new(SchemaValidator::from_config(&config.schema)),
            config: Arc::new(config),
            name,
            transport,
            publisher: OnceLock::new(),
            queue: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<PubSubConfig> {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn validator(&self) -> &Arc<SchemaValidator> {
        &self.validator
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher
            .get_or_init(|| {
                Arc::new(Publisher::new(
                    self.transport.clone(),
                    self.config.clone(),
                    self.validator.clone(),
                ))
            })
            .clone()
    }

    pub fn queue(&self) -> Arc<QueueAdapter> {
        self.queue
            .get_or_init(|| {
                Arc::new(QueueAdapter::new(
                    self.transport.clone(),
                    self.config.clone(),
                    self.publisher(),
                ))
            })
            .clone()
    }

    pub fn events(&self) -> EventPublisher {
        EventPublisher::new(self.publisher())
    }

    /// Poll subscriber on `{topic}{subscription_suffix}`.
    pub fn subscriber(&self, topic: &str) -> Subscriber {
        Subscriber::for_topic(self.transport.clone(), self.config.clone(), topic)
    }

    pub fn streaming_subscriber(&self, topic: &str) -> StreamingSubscriber {
        StreamingSubscriber::for_topic(self.transport.clone(), self.config.clone(), topic)
    }

    /// Subscriber of the kind selected by `subscription.mode`.
    pub fn consumer(&self, topic: &str) -> Box<dyn MessageConsumer> {
        match self.config.subscription.mode {
            SubscriberMode::Poll => Box::new(self.subscriber(topic)),
            SubscriberMode::Streaming => Box::new(self.streaming_subscriber(topic)),
        }
    }
}

/// Registry of named connections.
pub struct PubSubManager {
    default: String,
    connections: RwLock<BTreeMap<String, Arc<Connection>>>,
    shutdown: watch::Sender<bool>,
}

impl PubSubManager {
    /// Manager with a single connection named [`DEFAULT_CONNECTION`].
    pub fn new(transport: Arc<dyn Transport>, config: PubSubConfig) -> Result<Self> {
        let manager = Self::empty(DEFAULT_CONNECTION);
        manager.add_connection(DEFAULT_CONNECTION, transport, config)?;
        Ok(manager)
    }

    /// Manager without connections; `default` names the one used when callers
    /// pass `None`.
    pub fn empty(default: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            default: default.into(),
            connections: RwLock::new(BTreeMap::new()),
            shutdown,
        }
    }

    /// Connect to the configured service over REST.
    #[cfg(feature = "rest")]
    pub async fn connect(config: PubSubConfig) -> Result<Self> {
        config.validate()?;
        let transport = crate::transport::RestTransport::connect(&config.connection()).await?;
        Self::new(Arc::new(transport), config)
    }

    /// Register (or replace) a connection. The configuration is validated
    /// first.
    pub fn add_connection(
        &self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: PubSubConfig,
    ) -> Result<()> {
        config.validate()?;
        let name = name.into();
        info!(connection = %name, project_id = %config.project_id, "Pub/Sub connection registered");
        let connection = Arc::new(Connection::new(name.clone(), transport, config));
        write(&self.connections).insert(name, connection);
        Ok(())
    }

    pub fn connection_names(&self) -> Vec<String> {
        read(&self.connections).keys().cloned().collect()
    }

    /// The named connection, or the default when `name` is `None`.
    pub fn connection(&self, name: Option<&str>) -> Result<Arc<Connection>> {
        let name = name.unwrap_or(self.default.as_str());
        read(&self.connections)
            .get(name)
            .cloned()
            .ok_or_else(|| PubSubError::configuration(format!("unknown connection '{}'", name)))
    }

    pub fn publisher(&self, connection: Option<&str>) -> Result<Arc<Publisher>> {
        Ok(self.connection(connection)?.publisher())
    }

    pub fn events(&self, connection: Option<&str>) -> Result<EventPublisher> {
        Ok(self.connection(connection)?.events())
    }

    pub fn queue(&self, connection: Option<&str>) -> Result<Arc<QueueAdapter>> {
        Ok(self.connection(connection)?.queue())
    }

    pub fn subscriber(&self, topic: &str, connection: Option<&str>) -> Result<Subscriber> {
        Ok(self.connection(connection)?.subscriber(topic))
    }

    pub fn streaming_subscriber(
        &self,
        topic: &str,
        connection: Option<&str>,
    ) -> Result<StreamingSubscriber> {
        Ok(self.connection(connection)?.streaming_subscriber(topic))
    }

    pub fn consumer(&self, topic: &str, connection: Option<&str>) -> Result<Box<dyn MessageConsumer>> {
        Ok(self.connection(connection)?.consumer(topic))
    }

    /// Receiver that flips to `true` on [`shutdown`](Self::shutdown). Pass it
    /// to `StopCondition::on_shutdown` to tie consumer loops to the manager.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal consumers to stop and drop every connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let dropped = std::mem::take(&mut *write(&self.connections));
        info!(connections = dropped.len(), "Pub/Sub manager shut down");
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
