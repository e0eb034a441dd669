//! Idempotent topic and subscription creation.

use crate::config::PubSubConfig;
use crate::error::TransportError;
use crate::transport::{
    DeadLetterPolicy, RetryPolicy, SubscriptionHandle, SubscriptionOptions, TopicHandle,
    TopicOptions, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Create `topic` unless it exists. Returns `true` when this call created it.
pub async fn ensure_topic(
    transport: &Arc<dyn Transport>,
    topic: &str,
    options: &TopicOptions,
) -> Result<bool, TransportError> {
    let handle = TopicHandle::new(transport.clone(), topic);
    if handle.exists().await? {
        return Ok(false);
    }
    match handle.create(options).await {
        Ok(()) => {
            info!(topic = %topic, ordering = options.message_ordering, "Topic created");
            Ok(true)
        }
        Err(e) if e.is_already_exists() => {
            debug!(topic = %topic, "Topic created concurrently");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Create `subscription` unless it exists. Returns `true` when this call
/// created it.
pub async fn ensure_subscription(
    transport: &Arc<dyn Transport>,
    subscription: &str,
    options: &SubscriptionOptions,
) -> Result<bool, TransportError> {
    let handle = SubscriptionHandle::new(transport.clone(), subscription);
    if handle.exists().await? {
        return Ok(false);
    }
    match handle.create(options).await {
        Ok(()) => {
            info!(
                subscription = %subscription,
                topic = %options.topic,
                dead_letter = options.dead_letter_policy.is_some(),
                "Subscription created"
            );
            Ok(true)
        }
        Err(e) if e.is_already_exists() => {
            debug!(subscription = %subscription, "Subscription created concurrently");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Topic settings from configuration.
pub fn topic_options(config: &PubSubConfig, topic: &str) -> TopicOptions {
    TopicOptions {
        message_ordering: config.topic(topic).enable_message_ordering,
    }
}

/// Subscription settings for `topic` from configuration, including the
/// retry policy and, when enabled, the dead-letter policy.
pub fn subscription_options(config: &PubSubConfig, topic: &str) -> SubscriptionOptions {
    let dead_letter_policy = config.dead_letter_policy.enabled.then(|| DeadLetterPolicy {
        dead_letter_topic: config.dead_letter_policy.topic_for(topic),
        max_delivery_attempts: config.dead_letter_policy.max_delivery_attempts,
    });

    SubscriptionOptions {
        topic: topic.to_string(),
        ack_deadline_secs: config.subscription.ack_deadline_secs,
        retry_policy: Some(RetryPolicy {
            minimum_backoff: Duration::from_secs(config.retry_policy.minimum_backoff_secs),
            maximum_backoff: Duration::from_secs(config.retry_policy.maximum_backoff_secs),
        }),
        dead_letter_policy,
        enable_message_ordering: config.topic(topic).enable_message_ordering,
    }
}
