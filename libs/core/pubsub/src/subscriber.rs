//! Poll-mode consumption.
//!
//! A [`Subscriber`] owns one subscription, an ordered handler chain and an
//! optional error handler. `pull` processes a single batch; `listen` keeps
//! pulling until its [`StopCondition`] holds.
//!
//! Per-message failures (decode, handler, ack) never leave the loop: they go
//! to the error handler, or are logged when none is set.

use crate::config::{PubSubConfig, SubscriptionDefaults};
use crate::error::{PubSubError, Result, TransportError};
use crate::format::{FormatterKind, MessageFormatter};
use crate::handler::{ErrorContext, ErrorHandler, MessageHandler};
use crate::message::{self, DecodedMessage};
use crate::metrics::PubSubMetrics;
use crate::provision;
use crate::transport::{PullOptions, ReceivedMessage, SubscriptionHandle, TopicOptions, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, error, info, instrument, warn};

/// Counters for one consumption loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub empty_pulls: u64,
    pub pull_errors: u64,
}

type StopPredicate = Box<dyn Fn(&LoopStats) -> bool + Send + Sync>;

/// When a consumption loop ends.
///
/// Checked after every pull cycle. A shutdown channel additionally cuts
/// idle and backoff sleeps short.
#[derive(Default)]
pub struct StopCondition {
    predicate: Option<StopPredicate>,
    shutdown: Option<watch::Receiver<bool>>,
    closed: bool,
}

impl std::fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopCondition")
            .field("predicate", &self.predicate.is_some())
            .field("shutdown", &self.shutdown.is_some())
            .finish()
    }
}

impl StopCondition {
    /// Run until the process is terminated.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&LoopStats) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Box::new(predicate)),
            ..Default::default()
        }
    }

    /// Stop after `n` pull cycles.
    pub fn after_iterations(n: u64) -> Self {
        Self::when(move |stats| stats.iterations >= n)
    }

    /// Stop once `true` is sent on (or the sender drops) `shutdown`.
    pub fn on_shutdown(shutdown: watch::Receiver<bool>) -> Self {
        Self::default().or_shutdown(shutdown)
    }

    pub fn or_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn should_stop(&self, stats: &LoopStats) -> bool {
        if self.closed {
            return true;
        }
        if let Some(shutdown) = &self.shutdown
            && *shutdown.borrow()
        {
            return true;
        }
        self.predicate.as_ref().is_some_and(|p| p(stats))
    }

    /// Sleep, waking early on a shutdown signal.
    pub async fn sleep(&mut self, duration: Duration) {
        let Some(shutdown) = self.shutdown.as_mut() else {
            tokio::time::sleep(duration).await;
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    self.closed = true;
                }
            }
        }
    }
}

/// Options for [`Subscriber::listen`] and [`StreamingSubscriber::stream`](crate::StreamingSubscriber::stream).
#[derive(Debug, Default)]
pub struct ListenOptions {
    /// Batch size; configuration default when unset
    pub max_messages: Option<usize>,
    /// Idle sleep; configuration default when unset
    pub wait_time: Option<Duration>,
    pub stop: StopCondition,
}

impl ListenOptions {
    pub fn until(stop: StopCondition) -> Self {
        Self {
            stop,
            ..Default::default()
        }
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = Some(wait);
        self
    }
}

/// Result of one pull cycle.
#[derive(Debug, Default)]
pub(crate) struct CycleOutcome {
    pub received: usize,
    pub failed: usize,
    pub results: Vec<Value>,
}

/// Common entry point for poll and streaming consumers.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    fn subscription(&self) -> &str;

    fn add_handler(&mut self, handler: Arc<dyn MessageHandler>);

    fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>);

    /// Consume until the stop condition holds.
    async fn consume(&self, options: ListenOptions) -> Result<LoopStats>;
}

/// Poll-mode subscriber.
pub struct Subscriber {
    subscription: String,
    topic: Option<String>,
    transport: Arc<dyn Transport>,
    config: Arc<PubSubConfig>,
    settings: SubscriptionDefaults,
    formatter: Arc<dyn MessageFormatter>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    ensured: OnceCell<()>,
    metrics: PubSubMetrics,
}

impl Subscriber {
    /// Subscriber for an existing (or to-be-created) subscription name.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<PubSubConfig>,
        subscription: impl Into<String>,
    ) -> Self {
        let formatter = formatter_for(&config, config.default_formatter);
        Self {
            subscription: subscription.into(),
            topic: None,
            settings: config.subscription.clone(),
            metrics: PubSubMetrics::new(&config.app_name),
            transport,
            config,
            formatter,
            handlers: Vec::new(),
            error_handler: None,
            ensured: OnceCell::new(),
        }
    }

    /// Subscriber on `{topic}{subscription_suffix}`, able to create it.
    pub fn for_topic(
        transport: Arc<dyn Transport>,
        config: Arc<PubSubConfig>,
        topic: impl Into<String>,
    ) -> Self {
        let topic = topic.into();
        let subscription = config.subscription.subscription_for(&topic);
        Self::new(transport, config, subscription).with_topic(topic)
    }

    /// Topic used when the subscription has to be created. Also selects the
    /// topic's formatter.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        self.formatter = formatter_for(&self.config, self.config.formatter_for(&topic));
        self.topic = Some(topic);
        self
    }

    pub fn with_formatter(mut self, kind: FormatterKind) -> Self {
        self.formatter = formatter_for(&self.config, kind);
        self
    }

    pub fn with_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_auto_acknowledge(mut self, enabled: bool) -> Self {
        self.settings.auto_acknowledge = enabled;
        self
    }

    pub fn with_nack_on_error(mut self, enabled: bool) -> Self {
        self.settings.nack_on_error = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.subscription
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub fn settings(&self) -> &SubscriptionDefaults {
        &self.settings
    }

    pub(crate) fn settings_mut(&mut self) -> &mut SubscriptionDefaults {
        &mut self.settings
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(self.transport.clone(), self.subscription.clone())
    }

    /// Process one batch without blocking. Returns the final handler result
    /// of each message that made it through the chain.
    #[instrument(skip(self), fields(subscription = %self.subscription))]
    pub async fn pull(&self, max_messages: usize) -> Result<Vec<Value>> {
        self.ensure_subscription().await?;
        let outcome = self.cycle(PullOptions::immediate(max_messages)).await?;
        Ok(outcome.results)
    }

    /// Pull and decode without running handlers or acknowledging.
    pub async fn receive(&self, max_messages: usize) -> Result<Vec<DecodedMessage>> {
        let messages = self.pull_raw(&PullOptions::immediate(max_messages)).await?;
        let mut decoded = Vec::with_capacity(messages.len());
        for received in &messages {
            match message::decode(received, &self.subscription, self.formatter.as_ref()) {
                Ok(message) => decoded.push(message),
                Err(e) => self.report(&e, context_for(&self.subscription, received, None)),
            }
        }
        Ok(decoded)
    }

    /// Pull undecoded messages.
    pub async fn pull_raw(&self, options: &PullOptions) -> Result<Vec<ReceivedMessage>> {
        self.ensure_subscription().await?;
        let messages = self.handle().pull(options).await.map_err(|e| {
            PubSubError::subscription_with_source(
                format!("pull from '{}' failed", self.subscription),
                e,
            )
        })?;
        self.metrics.received(&self.subscription, messages.len());
        Ok(messages)
    }

    /// Pull and idle-sleep until the stop condition holds.
    ///
    /// Only a failure to set up the subscription ends the loop with an
    /// error; pull failures are reported and followed by a backoff sleep.
    #[instrument(skip(self, options), fields(subscription = %self.subscription))]
    pub async fn listen(&self, options: ListenOptions) -> Result<LoopStats> {
        let max_messages = options.max_messages.unwrap_or(self.settings.max_messages);
        let wait_time = options.wait_time.unwrap_or(self.settings.wait_time());
        self.run_loop(PullOptions::immediate(max_messages), wait_time, options.stop)
            .await
    }

    pub(crate) async fn run_loop(
        &self,
        pull: PullOptions,
        idle_sleep: Duration,
        mut stop: StopCondition,
    ) -> Result<LoopStats> {
        self.ensure_subscription().await?;
        info!(
            subscription = %self.subscription,
            max_messages = pull.max_messages,
            blocking = !pull.return_immediately,
            "Consumer started"
        );

        let mut stats = LoopStats::default();
        while !stop.should_stop(&stats) {
            stats.iterations += 1;

            let pause = match self.cycle(pull).await {
                Ok(outcome) => {
                    stats.received += outcome.received as u64;
                    stats.failed += outcome.failed as u64;
                    stats.processed += outcome.results.len() as u64;
                    if outcome.received == 0 {
                        stats.empty_pulls += 1;
                        Some(idle_sleep)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    stats.pull_errors += 1;
                    self.report(&e, ErrorContext::for_subscription(&self.subscription));
                    Some(self.settings.error_backoff())
                }
            };

            if let Some(pause) = pause
                && !stop.should_stop(&stats)
            {
                stop.sleep(pause).await;
            }
        }

        info!(
            subscription = %self.subscription,
            iterations = stats.iterations,
            processed = stats.processed,
            failed = stats.failed,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// One pull plus per-message processing.
    pub(crate) async fn cycle(&self, pull: PullOptions) -> Result<CycleOutcome> {
        let messages = self.pull_raw(&pull).await?;
        let mut outcome = CycleOutcome {
            received: messages.len(),
            ..Default::default()
        };

        for received in &messages {
            match self.process(received).await {
                Some(result) => outcome.results.push(result),
                None => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }

    /// Decode, run the chain, ack. `None` when the message failed.
    async fn process(&self, received: &ReceivedMessage) -> Option<Value> {
        let started = Instant::now();

        let decoded = match message::decode(received, &self.subscription, self.formatter.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.fail(e, received, None).await;
                return None;
            }
        };

        if self.config.monitoring.log_received {
            info!(
                subscription = %self.subscription,
                message_id = %decoded.id,
                compressed = decoded.compressed,
                "Message received"
            );
        }

        let result = match self.run_handlers(&decoded).await {
            Ok(result) => result,
            Err(e) => {
                self.fail(e, received, Some(&decoded)).await;
                return None;
            }
        };

        if self.settings.auto_acknowledge {
            if let Err(e) = self.acknowledge(&received.ack_id).await {
                // Left unacked: the service will redeliver.
                self.fail(e, received, Some(&decoded)).await;
                return None;
            }
        }

        self.metrics.processed(&self.subscription, started.elapsed());
        Some(result)
    }

    /// Decode and run the chain for a pushed message. Nothing is acked: the
    /// push response does that.
    #[cfg(feature = "webhook")]
    pub(crate) async fn process_pushed(&self, received: &ReceivedMessage) -> Option<Value> {
        let started = Instant::now();
        let outcome = match message::decode(received, &self.subscription, self.formatter.as_ref()) {
            Ok(decoded) => self
                .run_handlers(&decoded)
                .await
                .map_err(|e| (e, Some(decoded))),
            Err(e) => Err((e, None)),
        };

        match outcome {
            Ok(result) => {
                self.metrics.processed(&self.subscription, started.elapsed());
                Some(result)
            }
            Err((e, decoded)) => {
                self.metrics.failed(&self.subscription, e.kind());
                self.report(&e, context_for(&self.subscription, received, decoded.as_ref()));
                None
            }
        }
    }

    /// Report a failure that happened before a message could be built.
    #[cfg(feature = "webhook")]
    pub(crate) fn report_error(&self, error: &PubSubError) {
        self.metrics.failed(&self.subscription, error.kind());
        self.report(error, ErrorContext::for_subscription(&self.subscription));
    }

    async fn run_handlers(&self, message: &DecodedMessage) -> Result<Value> {
        let mut result = message.payload.clone();
        for handler in &self.handlers {
            result = handler
                .handle(message)
                .await
                .map_err(|e| PubSubError::handler(handler.name(), e))?;
        }
        Ok(result)
    }

    async fn fail(&self, error: PubSubError, received: &ReceivedMessage, decoded: Option<&DecodedMessage>) {
        self.metrics.failed(&self.subscription, error.kind());
        self.report(&error, context_for(&self.subscription, received, decoded));

        if self.settings.nack_on_error {
            match self.modify_ack_deadline(&[received.ack_id.clone()], 0).await {
                Ok(()) => debug!(message_id = %received.id, "Message nacked for redelivery"),
                Err(e) => warn!(message_id = %received.id, error = %e, "Failed to nack message"),
            }
        }
    }

    fn report(&self, error: &PubSubError, context: ErrorContext) {
        match &self.error_handler {
            Some(handler) => handler.on_error(error, &context),
            None if self.config.monitoring.log_failed => error!(
                subscription = %context.subscription,
                message_id = ?context.message_id,
                kind = error.kind(),
                error = %error,
                "Message processing failed"
            ),
            None => debug!(kind = error.kind(), error = %error, "Message processing failed"),
        }
    }

    pub async fn acknowledge(&self, ack_id: &str) -> Result<()> {
        self.handle().acknowledge(ack_id).await.map_err(|e| {
            PubSubError::subscription_with_source(format!("ack on '{}' failed", self.subscription), e)
        })?;
        self.metrics.acked(&self.subscription, 1);
        Ok(())
    }

    pub async fn acknowledge_batch(&self, ack_ids: &[String]) -> Result<()> {
        self.handle().acknowledge_batch(ack_ids).await.map_err(|e| {
            PubSubError::subscription_with_source(format!("ack on '{}' failed", self.subscription), e)
        })?;
        self.metrics.acked(&self.subscription, ack_ids.len());
        Ok(())
    }

    /// `0` requests immediate redelivery.
    pub async fn modify_ack_deadline(&self, ack_ids: &[String], deadline_secs: u32) -> Result<()> {
        self.handle()
            .modify_ack_deadline(ack_ids, deadline_secs)
            .await
            .map_err(|e| {
                PubSubError::subscription_with_source(
                    format!("modify ack deadline on '{}' failed", self.subscription),
                    e,
                )
            })?;
        if deadline_secs == 0 {
            self.metrics.nacked(&self.subscription, ack_ids.len());
        }
        Ok(())
    }

    /// Make sure the subscription exists, creating it (and its topic and
    /// dead-letter topic) on first use when auto-creation is on.
    pub async fn ensure_subscription(&self) -> Result<()> {
        self.ensured
            .get_or_try_init(|| self.provision())
            .await
            .map(|_| ())
    }

    async fn provision(&self) -> Result<()> {
        if !self.config.auto_create_subscriptions {
            return Ok(());
        }
        let wrap = |e: TransportError| {
            PubSubError::subscription_with_source(
                format!("cannot ensure subscription '{}'", self.subscription),
                e,
            )
        };

        if self.handle().exists().await.map_err(wrap)? {
            return Ok(());
        }
        let topic = self.topic.as_deref().ok_or_else(|| {
            PubSubError::configuration(format!(
                "subscription '{}' does not exist and no topic is set to create it from",
                self.subscription
            ))
        })?;

        if self.config.auto_create_topics {
            provision::ensure_topic(&self.transport, topic, &provision::topic_options(&self.config, topic))
                .await
                .map_err(wrap)?;
        }
        if self.config.dead_letter_policy.enabled {
            let dead_letter_topic = self.config.dead_letter_policy.topic_for(topic);
            provision::ensure_topic(&self.transport, &dead_letter_topic, &TopicOptions::default())
                .await
                .map_err(wrap)?;
        }

        let options = provision::subscription_options(&self.config, topic);
        provision::ensure_subscription(&self.transport, &self.subscription, &options)
            .await
            .map_err(wrap)?;
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer for Subscriber {
    fn subscription(&self) -> &str {
        &self.subscription
    }

    fn add_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    async fn consume(&self, options: ListenOptions) -> Result<LoopStats> {
        self.listen(options).await
    }
}

fn formatter_for(config: &PubSubConfig, kind: FormatterKind) -> Arc<dyn MessageFormatter> {
    let source = config
        .events
        .default_source
        .clone()
        .unwrap_or_else(|| format!("//{}", config.app_name));
    kind.build(&source, &format!("{}.message", config.app_name))
}

fn context_for(
    subscription: &str,
    received: &ReceivedMessage,
    decoded: Option<&DecodedMessage>,
) -> ErrorContext {
    ErrorContext {
        subscription: subscription.to_string(),
        message_id: Some(received.id.clone()),
        attributes: received.attributes.clone(),
        payload: decoded.map(|d| d.payload.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::handler::handler_fn;
    use crate::transport::MockTransport;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
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

    fn subscriber(mock: MockTransport, config: PubSubConfig) -> Subscriber {
        Subscriber::new(Arc::new(mock), Arc::new(config), "orders-subscription")
    }

    fn existing(mock: &mut MockTransport) {
        mock.expect_subscription_exists().returning(|_| Ok(true));
    }

    #[tokio::test]
    async fn test_pull_without_handlers_returns_payloads_and_acks() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull()
            .withf(|name, options| name == "orders-subscription" && options.return_immediately)
            .times(1)
            .returning(|_, _| Ok(vec![received("1", r#"{"order_id":1}"#)]));
        mock.expect_acknowledge()
            .withf(|_, ids| ids == ["ack-1".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));

        let results = subscriber(mock, PubSubConfig::new("acme")).pull(10).await.unwrap();
        assert_eq!(results, vec![json!({ "order_id": 1 })]);
    }

    #[tokio::test]
    async fn test_empty_pull_returns_empty_and_calls_nothing() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull().times(1).returning(|_, _| Ok(vec![]));
        mock.expect_acknowledge().times(0);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let subscriber = subscriber(mock, PubSubConfig::new("acme")).with_handler(handler_fn(
            "count",
            move |m: DecodedMessage| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(m.payload)
                }
            },
        ));

        assert!(subscriber.pull(10).await.unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_isolated_to_its_message() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull().returning(|_, _| {
            Ok(vec![
                received("1", r#"{"n":1}"#),
                received("2", r#"{"n":2}"#),
                received("3", r#"{"n":3}"#),
            ])
        });
        // Only messages 1 and 3 are acked.
        mock.expect_acknowledge()
            .withf(|_, ids| ids[0] != "ack-2")
            .times(2)
            .returning(|_, _| Ok(()));

        let second_ran = Arc::new(AtomicUsize::new(0));
        let counter = second_ran.clone();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();

        let subscriber = subscriber(mock, PubSubConfig::new("acme"))
            .with_handler(handler_fn("reject-two", |m: DecodedMessage| async move {
                if m.payload["n"] == 2 {
                    return Err::<Value, BoxError>("two is not allowed".into());
                }
                Ok(m.payload)
            }))
            .with_handler(handler_fn("double", move |m: DecodedMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(json!(m.payload["n"].as_i64().unwrap_or(0) * 2))
                }
            }))
            .with_error_handler(move |e: &PubSubError, ctx: &ErrorContext| {
                sink.lock().unwrap().push((e.kind(), ctx.message_id.clone()));
            });

        let results = subscriber.pull(10).await.unwrap();
        assert_eq!(results, vec![json!(2), json!(6)]);
        assert_eq!(second_ran.load(Ordering::SeqCst), 2);
        assert_eq!(
            errors.lock().unwrap().as_slice(),
            [("handler", Some("2".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_routes_format_error() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull()
            .returning(|_, _| Ok(vec![received("bad", "{\"oops\":"), received("ok", "{}")]));
        mock.expect_acknowledge().times(1).returning(|_, _| Ok(()));

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        let subscriber = subscriber(mock, PubSubConfig::new("acme")).with_error_handler(
            move |e: &PubSubError, _: &ErrorContext| sink.lock().unwrap().push(e.kind()),
        );

        let results = subscriber.pull(10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(kinds.lock().unwrap().as_slice(), ["format"]);
    }

    #[tokio::test]
    async fn test_nack_on_error_expires_deadline() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull().returning(|_, _| Ok(vec![received("1", "not json")]));
        mock.expect_modify_ack_deadline()
            .withf(|_, ids, deadline| ids == ["ack-1".to_string()] && *deadline == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_acknowledge().times(0);

        let subscriber = subscriber(mock, PubSubConfig::new("acme")).with_nack_on_error(true);
        assert!(subscriber.pull(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_acknowledge_off_leaves_messages() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull().returning(|_, _| Ok(vec![received("1", "{}")]));
        mock.expect_acknowledge().times(0);

        let subscriber = subscriber(mock, PubSubConfig::new("acme")).with_auto_acknowledge(false);
        assert_eq!(subscriber.pull(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_subscription_without_topic_is_configuration_error() {
        let mut mock = MockTransport::new();
        mock.expect_subscription_exists().returning(|_| Ok(false));
        mock.expect_create_subscription().times(0);
        mock.expect_pull().times(0);

        let err = subscriber(mock, PubSubConfig::new("acme")).pull(10).await.unwrap_err();
        assert!(matches!(err, PubSubError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_subscription_created_once_with_dead_letter_topic() {
        let mut mock = MockTransport::new();
        mock.expect_subscription_exists().times(1).returning(|_| Ok(false));
        mock.expect_topic_exists().returning(|_| Ok(false));
        mock.expect_create_topic()
            .withf(|topic, _| topic == "orders" || topic == "orders-dead-letter")
            .times(2)
            .returning(|_, _| Ok(()));
        mock.expect_create_subscription()
            .withf(|name, options| {
                name == "orders-subscription"
                    && options.topic == "orders"
                    && options
                        .dead_letter_policy
                        .as_ref()
                        .is_some_and(|p| p.dead_letter_topic == "orders-dead-letter")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_pull().times(2).returning(|_, _| Ok(vec![]));

        let config = Arc::new(PubSubConfig::new("acme").with_dead_letter(5));
        let subscriber = Subscriber::for_topic(Arc::new(mock), config, "orders");
        subscriber.pull(10).await.unwrap();
        subscriber.pull(10).await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_reports_pull_errors_and_keeps_going() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        let mut calls = 0;
        mock.expect_pull().times(3).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(TransportError::unavailable("503"))
            } else {
                Ok(vec![received(&calls.to_string(), "{}")])
            }
        });
        mock.expect_acknowledge().times(2).returning(|_, _| Ok(()));

        let errors = Arc::new(AtomicUsize::new(0));
        let sink = errors.clone();
        let subscriber = subscriber(mock, PubSubConfig::new("acme").with_error_backoff_ms(1))
            .with_error_handler(move |_: &PubSubError, _: &ErrorContext| {
                sink.fetch_add(1, Ordering::SeqCst);
            });

        let stats = subscriber
            .listen(ListenOptions::until(StopCondition::after_iterations(3)))
            .await
            .unwrap();
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.pull_errors, 1);
        assert_eq!(stats.processed, 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listen_stops_on_shutdown_signal() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull().returning(|_, _| Ok(vec![]));

        let (tx, rx) = watch::channel(false);
        let subscriber = subscriber(mock, PubSubConfig::new("acme").with_wait_time_ms(60_000));
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            subscriber.listen(ListenOptions::until(StopCondition::on_shutdown(rx))),
        )
        .await
        .expect("listen should stop on shutdown")
        .unwrap();
        stopper.await.unwrap();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.empty_pulls, 1);
    }

    #[tokio::test]
    async fn test_receive_decodes_without_acking() {
        let mut mock = MockTransport::new();
        existing(&mut mock);
        mock.expect_pull().returning(|_, _| Ok(vec![received("1", r#"{"a":1}"#)]));
        mock.expect_acknowledge().times(0);

        let messages = subscriber(mock, PubSubConfig::new("acme")).receive(5).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, json!({ "a": 1 }));
        assert_eq!(messages[0].ack_id, "ack-1");
    }
}
