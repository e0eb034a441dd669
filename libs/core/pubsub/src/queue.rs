//! Job-queue contract on top of topics and subscriptions.
//!
//! A queue named `q` is the topic `q` plus the subscription
//! `q{subscription_suffix}`. Jobs are JSON documents:
//!
//! ```json
//! {"id": "...", "display_name": "SendInvoice", "job": "SendInvoice", "data": {...}, "attempts": 0}
//! ```
//!
//! There is no server-side delay: `later` only stamps a `deliver_after`
//! attribute that consumers may honour through [`QueueJob::is_due`].

use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::message::{self, AttributeKey};
use crate::publisher::{PublishOptions, Publisher};
use crate::subscriber::Subscriber;
use crate::transport::{PullOptions, ReceivedMessage, Transport};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Queue facade over a publisher and one subscriber per queue.
pub struct QueueAdapter {
    transport: Arc<dyn Transport>,
    config: Arc<PubSubConfig>,
    publisher: Arc<Publisher>,
    subscribers: Mutex<HashMap<String, Arc<Subscriber>>>,
}

impl QueueAdapter {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<PubSubConfig>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            transport,
            config,
            publisher,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(self.config.queue.default_queue.as_str())
    }

    /// Push a job now. Returns the message id.
    #[instrument(skip(self, data), fields(job = %job))]
    pub async fn push(&self, job: &str, data: Value, queue: Option<&str>) -> Result<String> {
        self.push_with_attributes(job, data, queue, HashMap::new()).await
    }

    /// Push a job flagged for delivery no earlier than `delay` from now.
    #[instrument(skip(self, data), fields(job = %job))]
    pub async fn later(
        &self,
        delay: Duration,
        job: &str,
        data: Value,
        queue: Option<&str>,
    ) -> Result<String> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| PubSubError::configuration(format!("invalid delay: {}", e)))?;
        let deliver_after = (Utc::now() + delay).to_rfc3339_opts(SecondsFormat::Millis, true);
        let attributes = HashMap::from([(AttributeKey::DeliverAfter.to_string(), deliver_after)]);
        self.push_with_attributes(job, data, queue, attributes).await
    }

    async fn push_with_attributes(
        &self,
        job: &str,
        data: Value,
        queue: Option<&str>,
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        let queue = self.queue_name(queue).to_string();
        // Jobs pushed before the first pop must not be lost.
        self.subscriber(&queue).await.ensure_subscription().await?;

        let id = Uuid::new_v4().to_string();
        let payload = json!({
            "id": id,
            "display_name": job,
            "job": job,
            "data": data,
            "attempts": 0,
        });

        let message_id = self
            .publisher
            .publish(&queue, &payload, attributes, PublishOptions::default())
            .await?;
        info!(queue = %queue, job_id = %id, message_id = %message_id, "Job pushed");
        Ok(message_id)
    }

    /// Pull the next job, if any. Extra messages pulled beyond the first are
    /// handed back for redelivery.
    #[instrument(skip(self))]
    pub async fn pop(&self, queue: Option<&str>) -> Result<Option<QueueJob>> {
        let queue = self.queue_name(queue).to_string();
        let subscriber = self.subscriber(&queue).await;

        let max_messages = self.config.queue.max_messages.max(1);
        let mut messages = subscriber
            .pull_raw(&PullOptions::immediate(max_messages))
            .await?
            .into_iter();

        let Some(first) = messages.next() else {
            return Ok(None);
        };

        let rest: Vec<String> = messages.map(|m| m.ack_id).collect();
        if !rest.is_empty() {
            if let Err(e) = subscriber.modify_ack_deadline(&rest, 0).await {
                warn!(queue = %queue, error = %e, "Failed to release surplus messages");
            }
        }

        debug!(queue = %queue, message_id = %first.id, "Job popped");
        Ok(Some(QueueJob {
            queue,
            message: first,
            subscriber,
        }))
    }

    /// Pending job count. The service does not expose backlog size, so this
    /// is always 0.
    pub fn size(&self, _queue: Option<&str>) -> usize {
        0
    }

    async fn subscriber(&self, queue: &str) -> Arc<Subscriber> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers
            .entry(queue.to_string())
            .or_insert_with(|| {
                Arc::new(Subscriber::for_topic(
                    self.transport.clone(),
                    self.config.clone(),
                    queue,
                ))
            })
            .clone()
    }
}

/// One pulled job. `delete` and `release` consume it.
pub struct QueueJob {
    queue: String,
    message: ReceivedMessage,
    subscriber: Arc<Subscriber>,
}

impl std::fmt::Debug for QueueJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueJob")
            .field("queue", &self.queue)
            .field("job_id", &self.message.id)
            .finish()
    }
}

impl QueueJob {
    /// The transport message id.
    pub fn job_id(&self) -> &str {
        &self.message.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }

    pub fn ordering_key(&self) -> Option<&str> {
        self.message.ordering_key.as_deref()
    }

    /// Decompressed payload bytes.
    pub fn body(&self) -> Result<Vec<u8>> {
        message::body(&self.message).map_err(|e| {
            PubSubError::MessageConversion(format!("job {} body: {}", self.message.id, e))
        })
    }

    /// The job document.
    pub fn payload(&self) -> Result<Value> {
        let body = self.body()?;
        serde_json::from_slice(&body).map_err(|e| {
            PubSubError::MessageConversion(format!("job {} is not JSON: {}", self.message.id, e))
        })
    }

    /// `display_name` from the job document, falling back to `job`.
    pub fn display_name(&self) -> Option<String> {
        let payload = self.payload().ok()?;
        payload
            .get("display_name")
            .or_else(|| payload.get("job"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Attempt count: the document's `attempts` field, else the
    /// `delivery_attempt` attribute, else the transport's count, else 1.
    pub fn attempts(&self) -> u32 {
        self.payload()
            .ok()
            .and_then(|p| p.get("attempts").and_then(Value::as_u64))
            .and_then(|n| u32::try_from(n).ok())
            .or_else(|| {
                self.message
                    .attributes
                    .get(AttributeKey::DeliveryAttempt.as_ref())
                    .and_then(|v| v.parse().ok())
            })
            .or(self.message.delivery_attempt)
            .unwrap_or(1)
    }

    /// How many times the transport has delivered this message.
    pub fn redelivery_count(&self) -> Option<u32> {
        self.message.delivery_attempt
    }

    /// `deliver_after`, when the job was pushed with `later`.
    pub fn deliver_after(&self) -> Option<DateTime<Utc>> {
        self.message
            .attributes
            .get(AttributeKey::DeliverAfter.as_ref())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Whether `now` is at or past `deliver_after`. Jobs without one are
    /// always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deliver_after().is_none_or(|after| after <= now)
    }

    /// Acknowledge: the job is done.
    pub async fn delete(self) -> Result<()> {
        self.subscriber.acknowledge(&self.message.ack_id).await?;
        debug!(queue = %self.queue, message_id = %self.message.id, "Job deleted");
        Ok(())
    }

    /// Hand the job back; it becomes visible again after `delay`.
    pub async fn release(self, delay: Duration) -> Result<()> {
        let seconds = u32::try_from(delay.as_secs()).unwrap_or(u32::MAX);
        self.subscriber
            .modify_ack_deadline(&[self.message.ack_id.clone()], seconds)
            .await?;
        debug!(queue = %self.queue, message_id = %self.message.id, delay_secs = seconds, "Job released");
        Ok(())
    }
}
