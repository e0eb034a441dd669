//! Transport seam between the messaging layer and the pub/sub service.
//!
//! Everything above this module talks to a `dyn Transport`. Two
//! implementations ship with the crate:
//! - [`InMemoryTransport`]: process-local, full delivery semantics
//! - [`RestTransport`](rest::RestTransport): Pub/Sub REST v1 (feature `rest`)

pub mod memory;
#[cfg(feature = "rest")]
pub mod rest;

pub use memory::{InMemoryTransport, TransportCalls};
#[cfg(feature = "rest")]
pub use rest::{RestTransport, TokenSource};

use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Message as handed to the transport for publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
}

/// Message as delivered by a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Service-assigned message id
    pub id: String,
    /// Receipt handle for ack / deadline changes
    pub ack_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
    pub publish_time: DateTime<Utc>,
    /// Set by the service when the subscription has a dead-letter policy
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicOptions {
    pub message_ordering: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: String,
    pub max_delivery_attempts: u32,
}

/// Settings for a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub topic: String,
    pub ack_deadline_secs: u32,
    pub retry_policy: Option<RetryPolicy>,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub enable_message_ordering: bool,
}

impl SubscriptionOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ack_deadline_secs: 60,
            retry_policy: None,
            dead_letter_policy: None,
            enable_message_ordering: false,
        }
    }
}

/// Subscription as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub name: String,
    pub options: SubscriptionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOptions {
    pub max_messages: usize,
    /// `true` returns at once when nothing is available; `false` waits for
    /// messages up to the transport's pull timeout.
    pub return_immediately: bool,
}

impl PullOptions {
    pub fn immediate(max_messages: usize) -> Self {
        Self {
            max_messages,
            return_immediately: true,
        }
    }

    pub fn blocking(max_messages: usize) -> Self {
        Self {
            max_messages,
            return_immediately: false,
        }
    }
}

/// Operations the messaging layer needs from a pub/sub service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError>;

    /// Fails with `AlreadyExists` when the topic is present.
    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError>;

    /// Publish all messages in one call; returns one id per message, in order.
    async fn publish(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<Vec<String>, TransportError>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError>;

    /// Fails with `NotFound` when the topic is missing and `AlreadyExists`
    /// when the subscription is present.
    async fn create_subscription(
        &self,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<(), TransportError>;

    async fn subscription_info(&self, subscription: &str) -> Result<SubscriptionInfo, TransportError>;

    async fn pull(
        &self,
        subscription: &str,
        options: &PullOptions,
    ) -> Result<Vec<ReceivedMessage>, TransportError>;

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError>;

    /// A deadline of `0` makes the messages eligible for redelivery at once.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        deadline_secs: u32,
    ) -> Result<(), TransportError>;
}

/// Topic-scoped view over a transport.
#[derive(Clone)]
pub struct TopicHandle {
    name: String,
    transport: Arc<dyn Transport>,
}

impl TopicHandle {
    pub fn new(transport: Arc<dyn Transport>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn exists(&self) -> Result<bool, TransportError> {
        self.transport.topic_exists(&self.name).await
    }

    pub async fn create(&self, options: &TopicOptions) -> Result<(), TransportError> {
        self.transport.create_topic(&self.name, options).await
    }

    pub async fn publish(&self, message: OutboundMessage) -> Result<Vec<String>, TransportError> {
        self.transport.publish(&self.name, vec![message]).await
    }

    pub async fn publish_batch(
        &self,
        messages: Vec<OutboundMessage>,
    ) -> Result<Vec<String>, TransportError> {
        self.transport.publish(&self.name, messages).await
    }
}

/// Subscription-scoped view over a transport.
#[derive(Clone)]
pub struct SubscriptionHandle {
    name: String,
    transport: Arc<dyn Transport>,
}

impl SubscriptionHandle {
    pub fn new(transport: Arc<dyn Transport>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn exists(&self) -> Result<bool, TransportError> {
        self.transport.subscription_exists(&self.name).await
    }

    pub async fn create(&self, options: &SubscriptionOptions) -> Result<(), TransportError> {
        self.transport.create_subscription(&self.name, options).await
    }

    pub async fn info(&self) -> Result<SubscriptionInfo, TransportError> {
        self.transport.subscription_info(&self.name).await
    }

    pub async fn pull(&self, options: &PullOptions) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.transport.pull(&self.name, options).await
    }

    pub async fn acknowledge(&self, ack_id: &str) -> Result<(), TransportError> {
        self.transport
            .acknowledge(&self.name, &[ack_id.to_string()])
            .await
    }

    pub async fn acknowledge_batch(&self, ack_ids: &[String]) -> Result<(), TransportError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.transport.acknowledge(&self.name, ack_ids).await
    }

    pub async fn modify_ack_deadline(
        &self,
        ack_ids: &[String],
        deadline_secs: u32,
    ) -> Result<(), TransportError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.transport
            .modify_ack_deadline(&self.name, ack_ids, deadline_secs)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_subscription_handle_skips_empty_batches() {
        let mut mock = MockTransport::new();
        mock.expect_acknowledge().times(0);
        mock.expect_modify_ack_deadline().times(0);

        let handle = SubscriptionHandle::new(Arc::new(mock), "orders-subscription");
        handle.acknowledge_batch(&[]).await.unwrap();
        handle.modify_ack_deadline(&[], 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_handle_delegates_with_its_name() {
        let mut mock = MockTransport::new();
        mock.expect_topic_exists()
            .with(eq("orders"))
            .times(1)
            .returning(|_| Ok(true));
        mock.expect_publish()
            .withf(|topic, messages| topic == "orders" && messages.len() == 2)
            .times(1)
            .returning(|_, _| Ok(vec!["1".into(), "2".into()]));

        let handle = TopicHandle::new(Arc::new(mock), "orders");
        assert_eq!(handle.name(), "orders");
        assert!(handle.exists().await.unwrap());
        let ids = handle
            .publish_batch(vec![OutboundMessage::default(), OutboundMessage::default()])
            .await
            .unwrap();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
