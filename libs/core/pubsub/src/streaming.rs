//! Long-poll consumption.
//!
//! Same handler chain and error routing as [`Subscriber`], but each pull
//! blocks until messages arrive (or the transport's pull timeout passes)
//! and messages are acked one by one as soon as their chain completes.

use crate::config::PubSubConfig;
use crate::error::Result;
use crate::format::FormatterKind;
use crate::handler::{ErrorHandler, MessageHandler};
use crate::subscriber::{ListenOptions, LoopStats, MessageConsumer, Subscriber};
use crate::transport::{PullOptions, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Idle sleep after an empty long-poll when nothing else is configured.
const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(100);

pub struct StreamingSubscriber {
    inner: Subscriber,
    idle_sleep: Duration,
}

impl StreamingSubscriber {
    pub fn new(subscriber: Subscriber) -> Self {
        Self {
            inner: subscriber,
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }

    pub fn for_topic(
        transport: Arc<dyn Transport>,
        config: Arc<PubSubConfig>,
        topic: impl Into<String>,
    ) -> Self {
        Self::new(Subscriber::for_topic(transport, config, topic))
    }

    pub fn for_subscription(
        transport: Arc<dyn Transport>,
        config: Arc<PubSubConfig>,
        subscription: impl Into<String>,
    ) -> Self {
        Self::new(Subscriber::new(transport, config, subscription))
    }

    /// Messages requested per long-poll.
    pub fn with_flow_control(mut self, max_messages: usize) -> Self {
        self.inner.settings_mut().max_messages_per_pull = max_messages.max(1);
        self
    }

    /// Sleep after an empty long-poll.
    pub fn with_wait_time(mut self, wait_time_ms: u64) -> Self {
        self.idle_sleep = Duration::from_millis(wait_time_ms);
        self
    }

    pub fn with_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.inner = self.inner.with_handler(handler);
        self
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.inner = self.inner.with_error_handler(handler);
        self
    }

    pub fn with_nack_on_error(mut self, enabled: bool) -> Self {
        self.inner = self.inner.with_nack_on_error(enabled);
        self
    }

    pub fn with_formatter(mut self, kind: FormatterKind) -> Self {
        self.inner = self.inner.with_formatter(kind);
        self
    }

    pub fn max_messages_per_pull(&self) -> usize {
        self.inner.settings().max_messages_per_pull
    }

    pub fn idle_sleep(&self) -> Duration {
        self.idle_sleep
    }

    /// The underlying poll subscriber (acknowledge, receive, ...).
    pub fn subscriber(&self) -> &Subscriber {
        &self.inner
    }

    /// Long-poll until the stop condition holds. `options.max_messages`
    /// overrides the flow-control batch size; `options.wait_time` overrides
    /// the idle sleep.
    #[instrument(skip(self, options), fields(subscription = %self.inner.name()))]
    pub async fn stream(&self, options: ListenOptions) -> Result<LoopStats> {
        let max_messages = options
            .max_messages
            .unwrap_or(self.inner.settings().max_messages_per_pull);
        let idle_sleep = options.wait_time.unwrap_or(self.idle_sleep);
        self.inner
            .run_loop(PullOptions::blocking(max_messages), idle_sleep, options.stop)
            .await
    }

    /// Alias for [`stream`](Self::stream).
    pub async fn listen(&self, options: ListenOptions) -> Result<LoopStats> {
        self.stream(options).await
    }
}

#[async_trait]
impl MessageConsumer for StreamingSubscriber {
    fn subscription(&self) -> &str {
        self.inner.name()
    }

    fn add_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        MessageConsumer::add_handler(&mut self.inner, handler);
    }

    fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        MessageConsumer::set_error_handler(&mut self.inner, handler);
    }

    async fn consume(&self, options: ListenOptions) -> Result<LoopStats> {
        self.stream(options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BoxError, PubSubError};
    use crate::handler::{ErrorContext, handler_fn};
    use crate::message::DecodedMessage;
    use crate::subscriber::StopCondition;
    use crate::transport::{MockTransport, ReceivedMessage};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn received(id: &str, body: &str) -> ReceivedMessage {
        ReceivedMessage {
            id: id.into(),
            ack_id: format!("ack-{}", id),
            data: body.as_bytes().to_vec(),
            attributes: HashMap::new(),
            ordering_key: None,
            publish_time: Utc::now(),
            delivery_attempt: None,
        }
    }

    fn streaming(mock: MockTransport) -> StreamingSubscriber {
        StreamingSubscriber::for_subscription(
            Arc::new(mock),
            Arc::new(PubSubConfig::new("acme")),
            "orders-subscription",
        )
    }

    #[test]
    fn test_fluent_configuration() {
        let subscriber = streaming(MockTransport::new())
            .with_flow_control(25)
            .with_wait_time(10);
        assert_eq!(subscriber.max_messages_per_pull(), 25);
        assert_eq!(subscriber.idle_sleep(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_stream_uses_blocking_pulls_and_acks_each_message() {
        let mut mock = MockTransport::new();
        mock.expect_subscription_exists().returning(|_| Ok(true));
        mock.expect_pull()
            .withf(|_, options| !options.return_immediately && options.max_messages == 50)
            .times(2)
            .returning(|_, _| Ok(vec![received("1", "{}"), received("2", "{}")]));
        mock.expect_acknowledge()
            .withf(|_, ids| ids.len() == 1)
            .times(4)
            .returning(|_, _| Ok(()));

        let stats = streaming(mock)
            .with_flow_control(50)
            .stream(ListenOptions::until(StopCondition::after_iterations(2)))
            .await
            .unwrap();
        assert_eq!(stats.processed, 4);
    }

    #[tokio::test]
    async fn test_handler_error_nacks_when_enabled() {
        let mut mock = MockTransport::new();
        mock.expect_subscription_exists().returning(|_| Ok(true));
        mock.expect_pull()
            .times(1)
            .returning(|_, _| Ok(vec![received("1", "{}")]));
        mock.expect_acknowledge().times(0);
        mock.expect_modify_ack_deadline()
            .withf(|_, _, deadline| *deadline == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let errors = Arc::new(AtomicUsize::new(0));
        let sink = errors.clone();
        let subscriber = streaming(mock)
            .with_nack_on_error(true)
            .with_handler(handler_fn("fail", |_m: DecodedMessage| async move {
                Err::<serde_json::Value, BoxError>("boom".into())
            }))
            .with_error_handler(move |e: &PubSubError, _: &ErrorContext| {
                assert_eq!(e.kind(), "handler");
                sink.fetch_add(1, Ordering::SeqCst);
            });

        let stats = subscriber
            .listen(ListenOptions::until(StopCondition::after_iterations(1)))
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consumer_trait_object() {
        let mut mock = MockTransport::new();
        mock.expect_subscription_exists().returning(|_| Ok(true));
        mock.expect_pull().returning(|_, _| Ok(vec![]));

        let mut consumer: Box<dyn MessageConsumer> = Box::new(streaming(mock).with_wait_time(1));
        consumer.add_handler(Arc::new(handler_fn("noop", |m: DecodedMessage| async move {
            Ok::<_, BoxError>(m.payload)
        })));
        assert_eq!(consumer.subscription(), "orders-subscription");

        let stats = consumer
            .consume(ListenOptions::until(StopCondition::after_iterations(3)))
            .await
            .unwrap();
        assert_eq!(stats.empty_pulls, 3);
    }
}
