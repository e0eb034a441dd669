//! Publishing pipeline.
//!
//! Every publish goes through the same steps:
//! 1. ensure the topic exists (when auto-creation is on)
//! 2. validate against the topic's schema, if one is bound
//! 3. format with the topic's formatter
//! 4. compress when the policy says so, flagging the attributes
//! 5. add metadata attributes without overwriting caller keys
//! 6. attach the ordering key and mirror it as an attribute
//! 7. hand the message to the transport and return its id

use crate::compression::{self, COMPRESSION_TYPE, CompressionPolicy};
use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::format::{EnvelopeHints, FormatterKind, MessageFormatter};
use crate::message::{AttributeKey, hostname};
use crate::metrics::PubSubMetrics;
use crate::provision;
use crate::schema::SchemaValidator;
use crate::transport::{OutboundMessage, TopicHandle, Transport};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

const PUBLISHER_ID: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub ordering_key: Option<String>,
    /// Force compression on or off regardless of size
    pub compress: Option<bool>,
    /// Envelope metadata used by the `cloud_events` formatter
    pub hints: EnvelopeHints,
}

impl PublishOptions {
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn with_hints(mut self, hints: EnvelopeHints) -> Self {
        self.hints = hints;
        self
    }
}

/// One entry of a batch publish.
#[derive(Debug, Clone, Default)]
pub struct BatchMessage {
    pub payload: Value,
    pub attributes: HashMap<String, String>,
    /// Overrides the batch-wide options when set
    pub options: Option<PublishOptions>,
}

impl BatchMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Publishes payloads to topics.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    config: Arc<PubSubConfig>,
    validator: Arc<SchemaValidator>,
    compression: CompressionPolicy,
    formatters: HashMap<FormatterKind, Arc<dyn MessageFormatter>>,
    known_topics: Mutex<HashSet<String>>,
    metrics: PubSubMetrics,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<PubSubConfig>,
        validator: Arc<SchemaValidator>,
    ) -> Self {
        let source = config
            .events
            .default_source
            .clone()
            .unwrap_or_else(|| format!("//{}", config.app_name));
        let default_type = format!("{}.message", config.app_name);
        let formatters = [FormatterKind::Json, FormatterKind::CloudEvents]
            .into_iter()
            .map(|kind| (kind, kind.build(&source, &default_type)))
            .collect();

        Self {
            compression: CompressionPolicy::from(&config.message_options),
            metrics: PubSubMetrics::new(&config.app_name),
            transport,
            config,
            validator,
            formatters,
            known_topics: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Publish one payload and return the transport's message id.
    #[instrument(skip(self, payload, attributes, options), fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        attributes: HashMap<String, String>,
        options: PublishOptions,
    ) -> Result<String> {
        let started = Instant::now();
        let result = self.publish_inner(topic, payload, attributes, &options).await;

        match result {
            Ok(id) => {
                self.metrics.published(topic, 1, started.elapsed());
                if self.config.monitoring.log_published {
                    info!(
                        topic = %topic,
                        message_id = %id,
                        ordering_key = ?options.ordering_key,
                        "Message published"
                    );
                }
                Ok(id)
            }
            Err(e) => Err(self.failed(topic, e)),
        }
    }

    /// Publish several payloads in one transport call. Any failure fails the
    /// whole batch.
    #[instrument(skip(self, messages, options), fields(topic = %topic, count = messages.len()))]
    pub async fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<BatchMessage>,
        options: PublishOptions,
    ) -> Result<Vec<String>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let result = self.publish_batch_inner(topic, messages, &options).await;

        match result {
            Ok(ids) => {
                self.metrics.published(topic, ids.len(), started.elapsed());
                if self.config.monitoring.log_published {
                    info!(topic = %topic, count = ids.len(), "Batch published");
                }
                Ok(ids)
            }
            Err(e) => Err(self.failed(topic, e)),
        }
    }

    async fn publish_inner(
        &self,
        topic: &str,
        payload: &Value,
        attributes: HashMap<String, String>,
        options: &PublishOptions,
    ) -> Result<String> {
        self.ensure_topic(topic).await?;
        let message = self.prepare(topic, payload, attributes, options).await?;

        let ids = TopicHandle::new(self.transport.clone(), topic)
            .publish(message)
            .await
            .map_err(|e| PubSubError::publish_with_source(format!("publish to '{}' failed", topic), e))?;

        ids.into_iter()
            .next()
            .ok_or_else(|| PubSubError::publish("no message id returned"))
    }

    async fn publish_batch_inner(
        &self,
        topic: &str,
        messages: Vec<BatchMessage>,
        options: &PublishOptions,
    ) -> Result<Vec<String>> {
        self.ensure_topic(topic).await?;

        let expected = messages.len();
        let mut prepared = Vec::with_capacity(expected);
        for message in messages {
            let message_options = message.options.as_ref().unwrap_or(options);
            prepared.push(
                self.prepare(topic, &message.payload, message.attributes, message_options)
                    .await?,
            );
        }

        let ids = TopicHandle::new(self.transport.clone(), topic)
            .publish_batch(prepared)
            .await
            .map_err(|e| {
                PubSubError::publish_with_source(format!("batch publish to '{}' failed", topic), e)
            })?;

        if ids.len() != expected {
            return Err(PubSubError::publish(format!(
                "expected {} message ids, got {}",
                expected,
                ids.len()
            )));
        }
        Ok(ids)
    }

    /// Create the topic on first use when auto-creation is on. With it off
    /// a missing topic surfaces as the transport's not-found error.
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        if !self.config.auto_create_topics || self.known_topics.lock().await.contains(topic) {
            return Ok(());
        }

        provision::ensure_topic(
            &self.transport,
            topic,
            &provision::topic_options(&self.config, topic),
        )
        .await
        .map_err(|e| PubSubError::publish_with_source(format!("cannot ensure topic '{}'", topic), e))?;

        self.known_topics.lock().await.insert(topic.to_string());
        Ok(())
    }

    /// Steps 2–6: validate, format, compress, add metadata and ordering key.
    async fn prepare(
        &self,
        topic: &str,
        payload: &Value,
        mut attributes: HashMap<String, String>,
        options: &PublishOptions,
    ) -> Result<OutboundMessage> {
        let topic_config = self.config.topic(topic);
        if let Some(schema) = &topic_config.schema {
            self.validator.validate(payload, schema).await?;
        }

        let formatter = self.formatter(topic);
        let mut data = formatter.format(payload, &options.hints)?;

        attributes.retain(|key, _| {
            let reserved = AttributeKey::is_reserved(key);
            if reserved {
                debug!(attribute = %key, "Dropping caller value for reserved attribute");
            }
            !reserved
        });

        if self.compression.should_compress(&data, options.compress) {
            let before = data.len();
            data = compression::compress(&data)?;
            debug!(topic = %topic, before, after = data.len(), "Payload compressed");
            attributes.insert(AttributeKey::Compressed.to_string(), "true".to_string());
            attributes.insert(
                AttributeKey::CompressionType.to_string(),
                COMPRESSION_TYPE.to_string(),
            );
        }

        if self.config.message_options.add_metadata {
            let metadata = [
                (
                    AttributeKey::PublishedAt,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                (AttributeKey::Publisher, PUBLISHER_ID.to_string()),
                (AttributeKey::Hostname, hostname().to_string()),
                (AttributeKey::AppName, self.config.app_name.clone()),
            ];
            for (key, value) in metadata {
                attributes.entry(key.to_string()).or_insert(value);
            }
        }

        if let Some(key) = &options.ordering_key {
            attributes.insert(AttributeKey::OrderingKey.to_string(), key.clone());
        }

        Ok(OutboundMessage {
            data,
            attributes,
            ordering_key: options.ordering_key.clone(),
        })
    }

    fn formatter(&self, topic: &str) -> Arc<dyn MessageFormatter> {
        let kind = self.config.formatter_for(topic);
        self.formatters
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.build(&self.config.app_name, "message"))
    }

    fn failed(&self, topic: &str, err: PubSubError) -> PubSubError {
        self.metrics.publish_failed(topic, err.kind());
        if self.config.monitoring.log_failed {
            error!(topic = %topic, error = %err, kind = err.kind(), "Publish failed");
        }
        err
    }
}
