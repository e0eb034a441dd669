//! Process-local transport with service-like delivery semantics.
//!
//! Used by tests and local development. Behaviour follows the managed
//! service closely enough for the layer above not to notice:
//! - blocking pulls wait up to `pull_timeout` for messages
//! - pulled messages stay in flight until acked or their deadline lapses
//! - a zero deadline returns the message to the backlog immediately
//! - delivery attempts are counted; with a dead-letter policy a message is
//!   forwarded to the dead-letter topic once it exceeds the maximum
//! - ordering-enabled subscriptions hold back messages whose key is in flight
//!
//! Retry backoff is not simulated: nacked messages are redeliverable at once.

use super::{
    OutboundMessage, PullOptions, ReceivedMessage, SubscriptionInfo, SubscriptionOptions,
    TopicOptions, Transport,
};
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    ordering_key: Option<String>,
    publish_time: DateTime<Utc>,
    attempts: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct TopicState {
    options: TopicOptions,
    subscriptions: Vec<String>,
    published: Vec<OutboundMessage>,
}

#[derive(Debug)]
struct SubscriptionState {
    options: SubscriptionOptions,
    backlog: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicState>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
    next_ack_id: u64,
}

impl State {
    /// Fan a message out to every subscription of `topic`.
    fn deliver(&mut self, topic: &str, message: StoredMessage) {
        let Some(topic_state) = self.topics.get(topic) else {
            return;
        };
        for name in &topic_state.subscriptions {
            if let Some(subscription) = self.subscriptions.get_mut(name) {
                subscription.backlog.push_back(StoredMessage {
                    attempts: 0,
                    ..message.clone()
                });
            }
        }
    }

    fn reclaim_expired(&mut self, subscription: &str, now: Instant) {
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return;
        };
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            if let Some(entry) = state.in_flight.remove(&ack_id) {
                state.backlog.push_front(entry.message);
            }
        }
    }

    fn take(&mut self, subscription: &str, max: usize, now: Instant) -> Vec<ReceivedMessage> {
        self.reclaim_expired(subscription, now);

        let mut delivered = Vec::new();
        let mut dead_lettered = Vec::new();
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return delivered;
        };

        let mut held_keys: HashSet<String> = if state.options.enable_message_ordering {
            state
                .in_flight
                .values()
                .filter_map(|entry| entry.message.ordering_key.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut remaining = VecDeque::with_capacity(state.backlog.len());
        while let Some(mut message) = state.backlog.pop_front() {
            if delivered.len() >= max {
                remaining.push_back(message);
                continue;
            }
            if let Some(key) = &message.ordering_key
                && state.options.enable_message_ordering
            {
                if held_keys.contains(key) {
                    remaining.push_back(message);
                    continue;
                }
                held_keys.insert(key.clone());
            }

            message.attempts += 1;
            if let Some(policy) = &state.options.dead_letter_policy
                && message.attempts > policy.max_delivery_attempts
            {
                dead_lettered.push((policy.dead_letter_topic.clone(), message));
                continue;
            }

            self.next_ack_id += 1;
            let ack_id = format!("{}:{}", subscription, self.next_ack_id);
            delivered.push(ReceivedMessage {
                id: message.id.clone(),
                ack_id: ack_id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                ordering_key: message.ordering_key.clone(),
                publish_time: message.publish_time,
                delivery_attempt: state
                    .options
                    .dead_letter_policy
                    .as_ref()
                    .map(|_| message.attempts),
            });
            let deadline = now + Duration::from_secs(u64::from(state.options.ack_deadline_secs));
            state.in_flight.insert(ack_id, InFlight { message, deadline });
        }
        state.backlog = remaining;

        for (topic, message) in dead_lettered {
            if self.topics.contains_key(&topic) {
                debug!(message_id = %message.id, dead_letter_topic = %topic, "Forwarding to dead-letter topic");
                self.deliver(&topic, message);
            } else {
                warn!(message_id = %message.id, dead_letter_topic = %topic, "Dead-letter topic missing, dropping message");
            }
        }

        delivered
    }
}

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCalls {
    pub topic_exists: usize,
    pub create_topic: usize,
    pub publish: usize,
    pub subscription_exists: usize,
    pub create_subscription: usize,
    pub pull: usize,
    pub acknowledge: usize,
    pub modify_ack_deadline: usize,
}

#[derive(Debug, Default)]
struct CallCounters {
    topic_exists: AtomicUsize,
    create_topic: AtomicUsize,
    publish: AtomicUsize,
    subscription_exists: AtomicUsize,
    create_subscription: AtomicUsize,
    pull: AtomicUsize,
    acknowledge: AtomicUsize,
    modify_ack_deadline: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// In-memory [`Transport`].
#[derive(Debug)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    notify: Notify,
    pull_timeout: Duration,
    calls: CallCounters,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            pull_timeout: Duration::from_millis(500),
            calls: CallCounters::default(),
        }
    }

    /// How long a blocking pull waits for messages before returning empty.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn calls(&self) -> TransportCalls {
        TransportCalls {
            topic_exists: self.calls.topic_exists.load(Ordering::Relaxed),
            create_topic: self.calls.create_topic.load(Ordering::Relaxed),
            publish: self.calls.publish.load(Ordering::Relaxed),
            subscription_exists: self.calls.subscription_exists.load(Ordering::Relaxed),
            create_subscription: self.calls.create_subscription.load(Ordering::Relaxed),
            pull: self.calls.pull.load(Ordering::Relaxed),
            acknowledge: self.calls.acknowledge.load(Ordering::Relaxed),
            modify_ack_deadline: self.calls.modify_ack_deadline.load(Ordering::Relaxed),
        }
    }

    /// Every message ever published to `topic`, as sent.
    pub async fn published(&self, topic: &str) -> Vec<OutboundMessage> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }

    /// Messages waiting for delivery on `subscription`.
    pub async fn backlog_len(&self, subscription: &str) -> usize {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(subscription)
            .map(|s| s.backlog.len())
            .unwrap_or(0)
    }

    /// Messages delivered but not yet acked on `subscription`.
    pub async fn in_flight_len(&self, subscription: &str) -> usize {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(subscription)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    pub async fn topic_options(&self, topic: &str) -> Option<TopicOptions> {
        let state = self.state.lock().await;
        state.topics.get(topic).map(|t| t.options.clone())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        bump(&self.calls.topic_exists);
        Ok(self.state.lock().await.topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        bump(&self.calls.create_topic);
        let mut state = self.state.lock().await;
        if state.topics.contains_key(topic) {
            return Err(TransportError::already_exists(format!("topic '{}'", topic)));
        }
        state.topics.insert(
            topic.to_string(),
            TopicState {
                options: options.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<Vec<String>, TransportError> {
        bump(&self.calls.publish);
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(topic) {
            return Err(TransportError::not_found(format!("topic '{}'", topic)));
        }

        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            state.next_message_id += 1;
            let id = state.next_message_id.to_string();
            let stored = StoredMessage {
                id: id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                ordering_key: message.ordering_key.clone(),
                publish_time: Utc::now(),
                attempts: 0,
            };
            if let Some(topic_state) = state.topics.get_mut(topic) {
                topic_state.published.push(message);
            }
            state.deliver(topic, stored);
            ids.push(id);
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        bump(&self.calls.subscription_exists);
        Ok(self.state.lock().await.subscriptions.contains_key(subscription))
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<(), TransportError> {
        bump(&self.calls.create_subscription);
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(subscription) {
            return Err(TransportError::already_exists(format!(
                "subscription '{}'",
                subscription
            )));
        }
        let Some(topic) = state.topics.get_mut(&options.topic) else {
            return Err(TransportError::not_found(format!("topic '{}'", options.topic)));
        };
        topic.subscriptions.push(subscription.to_string());
        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                options: options.clone(),
                backlog: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn subscription_info(&self, subscription: &str) -> Result<SubscriptionInfo, TransportError> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(subscription)
            .map(|s| SubscriptionInfo {
                name: subscription.to_string(),
                options: s.options.clone(),
            })
            .ok_or_else(|| TransportError::not_found(format!("subscription '{}'", subscription)))
    }

    async fn pull(
        &self,
        subscription: &str,
        options: &PullOptions,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        bump(&self.calls.pull);
        let give_up_at = Instant::now() + self.pull_timeout;

        loop {
            {
                let mut state = self.state.lock().await;
                if !state.subscriptions.contains_key(subscription) {
                    return Err(TransportError::not_found(format!(
                        "subscription '{}'",
                        subscription
                    )));
                }
                let messages = state.take(subscription, options.max_messages, Instant::now());
                if !messages.is_empty() || options.return_immediately {
                    return Ok(messages);
                }
            }

            let now = Instant::now();
            if now >= give_up_at {
                return Ok(Vec::new());
            }
            let wait = (give_up_at - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        bump(&self.calls.acknowledge);
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(TransportError::not_found(format!(
                "subscription '{}'",
                subscription
            )));
        };
        for ack_id in ack_ids {
            // Unknown or expired receipts are ignored, as the service does.
            sub.in_flight.remove(ack_id);
        }
        drop(state);

        // Acks can release held ordering keys.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        deadline_secs: u32,
    ) -> Result<(), TransportError> {
        bump(&self.calls.modify_ack_deadline);
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(TransportError::not_found(format!(
                "subscription '{}'",
                subscription
            )));
        };

        let now = Instant::now();
        for ack_id in ack_ids {
            if deadline_secs == 0 {
                if let Some(entry) = sub.in_flight.remove(ack_id) {
                    sub.backlog.push_front(entry.message);
                }
            } else if let Some(entry) = sub.in_flight.get_mut(ack_id) {
                entry.deadline = now + Duration::from_secs(u64::from(deadline_secs));
            }
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeadLetterPolicy;

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage {
            data: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    async fn setup(options: SubscriptionOptions) -> InMemoryTransport {
        let transport = InMemoryTransport::new().with_pull_timeout(Duration::from_millis(50));
        transport
            .create_topic(&options.topic, &TopicOptions::default())
            .await
            .unwrap();
        transport.create_subscription("sub", &options).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_publish_to_missing_topic_is_not_found() {
        let transport = InMemoryTransport::new();
        let err = transport.publish("nope", vec![message("x")]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let transport = InMemoryTransport::new();
        transport.create_topic("t", &TopicOptions::default()).await.unwrap();
        let err = transport
            .create_topic("t", &TopicOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_subscription_requires_topic() {
        let transport = InMemoryTransport::new();
        let err = transport
            .create_subscription("sub", &SubscriptionOptions::new("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ack_removes_and_nack_redelivers() {
        let transport = setup(SubscriptionOptions::new("t")).await;
        transport.publish("t", vec![message("a")]).await.unwrap();

        let first = transport.pull("sub", &PullOptions::immediate(10)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(transport.in_flight_len("sub").await, 1);
        assert!(
            transport
                .pull("sub", &PullOptions::immediate(10))
                .await
                .unwrap()
                .is_empty()
        );

        transport
            .modify_ack_deadline("sub", &[first[0].ack_id.clone()], 0)
            .await
            .unwrap();
        let again = transport.pull("sub", &PullOptions::immediate(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        assert_ne!(again[0].ack_id, first[0].ack_id);

        transport.acknowledge("sub", &[again[0].ack_id.clone()]).await.unwrap();
        assert_eq!(transport.in_flight_len("sub").await, 0);
        assert_eq!(transport.backlog_len("sub").await, 0);
    }

    #[tokio::test]
    async fn test_blocking_pull_times_out_empty() {
        let transport = setup(SubscriptionOptions::new("t")).await;
        let messages = transport.pull("sub", &PullOptions::blocking(5)).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_pull_wakes_on_publish() {
        let transport = std::sync::Arc::new(
            setup(SubscriptionOptions::new("t"))
                .await
                .with_pull_timeout(Duration::from_secs(5)),
        );
        let puller = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.pull("sub", &PullOptions::blocking(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.publish("t", vec![message("late")]).await.unwrap();

        let messages = puller.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, b"late");
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let transport = InMemoryTransport::new();
        transport.create_topic("t", &TopicOptions::default()).await.unwrap();
        transport.create_topic("t-dead-letter", &TopicOptions::default()).await.unwrap();
        transport
            .create_subscription("dlq", &SubscriptionOptions::new("t-dead-letter"))
            .await
            .unwrap();
        let mut options = SubscriptionOptions::new("t");
        options.dead_letter_policy = Some(DeadLetterPolicy {
            dead_letter_topic: "t-dead-letter".into(),
            max_delivery_attempts: 2,
        });
        transport.create_subscription("sub", &options).await.unwrap();
        transport.publish("t", vec![message("poison")]).await.unwrap();

        for attempt in 1..=2 {
            let pulled = transport.pull("sub", &PullOptions::immediate(1)).await.unwrap();
            assert_eq!(pulled[0].delivery_attempt, Some(attempt));
            transport
                .modify_ack_deadline("sub", &[pulled[0].ack_id.clone()], 0)
                .await
                .unwrap();
        }

        assert!(
            transport
                .pull("sub", &PullOptions::immediate(1))
                .await
                .unwrap()
                .is_empty()
        );
        let dead = transport.pull("dlq", &PullOptions::immediate(1)).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].data, b"poison");
    }

    #[tokio::test]
    async fn test_ordering_key_held_while_in_flight() {
        let mut options = SubscriptionOptions::new("t");
        options.enable_message_ordering = true;
        let transport = setup(options).await;
        let keyed = |body: &str| OutboundMessage {
            ordering_key: Some("customer-1".into()),
            ..message(body)
        };
        transport
            .publish("t", vec![keyed("first"), keyed("second")])
            .await
            .unwrap();

        let batch = transport.pull("sub", &PullOptions::immediate(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data, b"first");

        transport.acknowledge("sub", &[batch[0].ack_id.clone()]).await.unwrap();
        let batch = transport.pull("sub", &PullOptions::immediate(10)).await.unwrap();
        assert_eq!(batch[0].data, b"second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_redelivers() {
        let mut options = SubscriptionOptions::new("t");
        options.ack_deadline_secs = 10;
        let transport = setup(options).await;
        transport.publish("t", vec![message("slow")]).await.unwrap();

        let first = transport.pull("sub", &PullOptions::immediate(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        tokio::time::advance(Duration::from_secs(11)).await;

        let again = transport.pull("sub", &PullOptions::immediate(1)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
    }
}
