//! Configuration for publishers, subscribers and the queue adapter.
//!
//! `PubSubConfig` can be built three ways:
//! - `PubSubConfig::new(project)` plus `with_*` builder methods
//! - `PubSubConfig::from_env()` (`PUBSUB_*` variables)
//! - `PubSubConfig::from_json_file(path)` (every field optional, defaults apply)

use crate::error::{PubSubError, Result};
use crate::format::FormatterKind;
use crate::schema::SchemaSource;
use core_config::pubsub::{CredentialsMethod, PubSubConnectionConfig};
use core_config::{env_flag, env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// Which consumption strategy `PubSubManager::consumer` builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriberMode {
    /// Periodic non-blocking pulls
    #[default]
    Poll,
    /// Continuous blocking pulls
    Streaming,
}

/// Credentials selection as it appears in configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    ApplicationDefault,
    KeyFile,
}

/// Message options applied by the publisher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageOptions {
    /// Inject `published_at`, `publisher`, `hostname`, `app_name`
    pub add_metadata: bool,
    /// Global compression switch (explicit per-publish overrides still win)
    pub compress_payload: bool,
    /// Payloads strictly larger than this many bytes are compressed
    pub compression_threshold: usize,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            add_metadata: true,
            compress_payload: true,
            compression_threshold: 1024,
        }
    }
}

/// Redelivery backoff the transport applies to nacked messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub minimum_backoff_secs: u64,
    pub maximum_backoff_secs: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            minimum_backoff_secs: 10,
            maximum_backoff_secs: 600,
        }
    }
}

/// Dead-letter wiring for auto-created subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub max_delivery_attempts: u32,
    pub dead_letter_topic_suffix: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_delivery_attempts: 5,
            dead_letter_topic_suffix: "-dead-letter".to_string(),
        }
    }
}

impl DeadLetterConfig {
    /// Dead-letter topic name for `topic`.
    pub fn topic_for(&self, topic: &str) -> String {
        format!("{}{}", topic, self.dead_letter_topic_suffix)
    }
}

/// Subscription defaults and consumption loop tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionDefaults {
    pub ack_deadline_secs: u32,
    /// Batch size for `pull`/`listen`
    pub max_messages: usize,
    /// Idle sleep between polls in `listen`
    pub wait_time_ms: u64,
    /// Appended to the topic name to derive subscription names
    pub subscription_suffix: String,
    pub auto_acknowledge: bool,
    /// Expire the ack deadline immediately when processing fails
    pub nack_on_error: bool,
    pub mode: SubscriberMode,
    /// Batch size for each blocking pull in streaming mode
    pub max_messages_per_pull: usize,
    /// Sleep after a failed pull before trying again
    pub error_backoff_ms: u64,
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 60,
            max_messages: 10,
            wait_time_ms: 3000,
            subscription_suffix: "-subscription".to_string(),
            auto_acknowledge: true,
            nack_on_error: false,
            mode: SubscriberMode::Poll,
            max_messages_per_pull: 100,
            error_backoff_ms: 5000,
        }
    }
}

impl SubscriptionDefaults {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Subscription name for `topic` using the configured suffix.
    pub fn subscription_for(&self, topic: &str) -> String {
        format!("{}{}", topic, self.subscription_suffix)
    }
}

/// Per-topic overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub enable_message_ordering: bool,
    /// Name of a registered schema every payload must satisfy
    pub schema: Option<String>,
    pub formatter: Option<FormatterKind>,
}

/// Schema registry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Unknown schema names fail validation instead of being skipped
    pub strict_mode: bool,
    pub schemas: HashMap<String, SchemaSource>,
}

/// Per-event logging toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_published: bool,
    pub log_received: bool,
    pub log_failed: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_published: true,
            log_received: true,
            log_failed: true,
        }
    }
}

/// Queue adapter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub default_queue: String,
    /// Messages pulled per `pop`; only the first is returned
    pub max_messages: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            max_messages: 1,
        }
    }
}

/// Event publishing topic resolution.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Used when an event neither names a topic nor appears in `topics`
    pub default_topic: Option<String>,
    /// Event type tag → topic
    pub topics: HashMap<String, String>,
    /// `source` for envelopes built without one
    pub default_source: Option<String>,
}

/// Push endpoint settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// Bearer token push requests must carry; no check when unset
    pub auth_token: Option<String>,
}

/// Complete messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub project_id: String,
    pub auth_method: AuthMethod,
    pub key_file: Option<PathBuf>,
    pub emulator_host: Option<String>,
    /// Reported in the `app_name` attribute and as default envelope source
    pub app_name: String,
    pub auto_create_topics: bool,
    pub auto_create_subscriptions: bool,
    pub default_formatter: FormatterKind,
    pub message_options: MessageOptions,
    pub retry_policy: RetryPolicyConfig,
    pub dead_letter_policy: DeadLetterConfig,
    pub subscription: SubscriptionDefaults,
    pub topics: HashMap<String, TopicConfig>,
    pub schema: SchemaConfig,
    pub monitoring: MonitoringConfig,
    pub queue: QueueSettings,
    pub events: EventSettings,
    pub webhook: WebhookSettings,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            auth_method: AuthMethod::ApplicationDefault,
            key_file: None,
            emulator_host: None,
            app_name: "pubsub".to_string(),
            auto_create_topics: true,
            auto_create_subscriptions: true,
            default_formatter: FormatterKind::Json,
            message_options: MessageOptions::default(),
            retry_policy: RetryPolicyConfig::default(),
            dead_letter_policy: DeadLetterConfig::default(),
            subscription: SubscriptionDefaults::default(),
            topics: HashMap::new(),
            schema: SchemaConfig::default(),
            monitoring: MonitoringConfig::default(),
            queue: QueueSettings::default(),
            events: EventSettings::default(),
            webhook: WebhookSettings::default(),
        }
    }
}

impl PubSubConfig {
    /// Create a configuration for `project_id` with defaults everywhere else.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PubSubError::configuration(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PubSubError::configuration(format!("invalid config '{}': {}", path.display(), e))
        })
    }

    /// Fail fast on settings that can never work.
    pub fn validate(&self) -> Result<()> {
        self.connection().validate()?;

        if self.message_options.compression_threshold == 0 && self.message_options.compress_payload {
            tracing::debug!("compression_threshold is 0, every non-empty payload will be compressed");
        }
        if self.dead_letter_policy.enabled
            && !(5..=100).contains(&self.dead_letter_policy.max_delivery_attempts)
        {
            return Err(PubSubError::configuration(format!(
                "max_delivery_attempts must be between 5 and 100, got {}",
                self.dead_letter_policy.max_delivery_attempts
            )));
        }
        if self.retry_policy.minimum_backoff_secs > self.retry_policy.maximum_backoff_secs {
            return Err(PubSubError::configuration(
                "minimum_backoff_secs must not exceed maximum_backoff_secs",
            ));
        }
        for (topic, topic_config) in &self.topics {
            if let Some(schema) = &topic_config.schema
                && self.schema.strict_mode
                && !self.schema.schemas.contains_key(schema)
            {
                return Err(PubSubError::configuration(format!(
                    "topic '{}' is bound to unknown schema '{}'",
                    topic, schema
                )));
            }
        }
        Ok(())
    }

    /// Connection settings in the shape the transports consume.
    pub fn connection(&self) -> PubSubConnectionConfig {
        let credentials = match (&self.auth_method, &self.key_file) {
            (AuthMethod::KeyFile, Some(path)) => CredentialsMethod::KeyFile(path.clone()),
            // A key file without a path is caught by `validate`.
            (AuthMethod::KeyFile, None) => CredentialsMethod::KeyFile(PathBuf::new()),
            (AuthMethod::ApplicationDefault, _) => CredentialsMethod::ApplicationDefault,
        };
        PubSubConnectionConfig {
            project_id: self.project_id.clone(),
            credentials,
            emulator_host: self.emulator_host.clone(),
        }
    }

    /// Overrides for `topic`, or the defaults.
    pub fn topic(&self, topic: &str) -> TopicConfig {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Formatter for `topic` (topic override, then global default).
    pub fn formatter_for(&self, topic: &str) -> FormatterKind {
        self.topics
            .get(topic)
            .and_then(|t| t.formatter)
            .unwrap_or(self.default_formatter)
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_emulator(mut self, host: impl Into<String>) -> Self {
        self.emulator_host = Some(host.into());
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_method = AuthMethod::KeyFile;
        self.key_file = Some(path.into());
        self
    }

    pub fn with_auto_create(mut self, topics: bool, subscriptions: bool) -> Self {
        self.auto_create_topics = topics;
        self.auto_create_subscriptions = subscriptions;
        self
    }

    pub fn with_default_formatter(mut self, kind: FormatterKind) -> Self {
        self.default_formatter = kind;
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.message_options.add_metadata = enabled;
        self
    }

    pub fn with_compression(mut self, enabled: bool, threshold: usize) -> Self {
        self.message_options.compress_payload = enabled;
        self.message_options.compression_threshold = threshold;
        self
    }

    pub fn with_dead_letter(mut self, max_delivery_attempts: u32) -> Self {
        self.dead_letter_policy.enabled = true;
        self.dead_letter_policy.max_delivery_attempts = max_delivery_attempts;
        self
    }

    pub fn with_retry_policy(mut self, minimum_backoff_secs: u64, maximum_backoff_secs: u64) -> Self {
        self.retry_policy = RetryPolicyConfig {
            minimum_backoff_secs,
            maximum_backoff_secs,
        };
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>, config: TopicConfig) -> Self {
        self.topics.insert(topic.into(), config);
        self
    }

    pub fn with_schema(mut self, name: impl Into<String>, source: SchemaSource) -> Self {
        self.schema.schemas.insert(name.into(), source);
        self
    }

    pub fn with_strict_schemas(mut self, strict: bool) -> Self {
        self.schema.strict_mode = strict;
        self
    }

    pub fn with_auto_acknowledge(mut self, enabled: bool) -> Self {
        self.subscription.auto_acknowledge = enabled;
        self
    }

    pub fn with_nack_on_error(mut self, enabled: bool) -> Self {
        self.subscription.nack_on_error = enabled;
        self
    }

    pub fn with_subscriber_mode(mut self, mode: SubscriberMode) -> Self {
        self.subscription.mode = mode;
        self
    }

    pub fn with_wait_time_ms(mut self, wait_time_ms: u64) -> Self {
        self.subscription.wait_time_ms = wait_time_ms;
        self
    }

    pub fn with_error_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.subscription.error_backoff_ms = backoff_ms;
        self
    }
}

impl FromEnv for PubSubConfig {
    fn from_env() -> std::result::Result<Self, ConfigError> {
        let connection = PubSubConnectionConfig::from_env()?;
        let defaults = PubSubConfig::default();

        let (auth_method, key_file) = match connection.credentials {
            CredentialsMethod::KeyFile(path) => (AuthMethod::KeyFile, Some(path)),
            CredentialsMethod::ApplicationDefault => (AuthMethod::ApplicationDefault, None),
        };

        let default_formatter = match env_optional("PUBSUB_FORMATTER") {
            Some(raw) => raw.parse::<FormatterKind>().map_err(|e| ConfigError::ParseError {
                key: "PUBSUB_FORMATTER".to_string(),
                details: e.to_string(),
            })?,
            None => defaults.default_formatter,
        };

        let mode = match env_optional("PUBSUB_SUBSCRIBER_MODE") {
            Some(raw) => raw.parse::<SubscriberMode>().map_err(|e| ConfigError::ParseError {
                key: "PUBSUB_SUBSCRIBER_MODE".to_string(),
                details: e.to_string(),
            })?,
            None => defaults.subscription.mode,
        };

        Ok(Self {
            project_id: connection.project_id,
            auth_method,
            key_file,
            emulator_host: connection.emulator_host,
            app_name: env_or_default("APP_NAME", &defaults.app_name),
            auto_create_topics: env_flag("PUBSUB_AUTO_CREATE_TOPICS", defaults.auto_create_topics)?,
            auto_create_subscriptions: env_flag(
                "PUBSUB_AUTO_CREATE_SUBSCRIPTIONS",
                defaults.auto_create_subscriptions,
            )?,
            default_formatter,
            message_options: MessageOptions {
                add_metadata: env_flag("PUBSUB_ADD_METADATA", defaults.message_options.add_metadata)?,
                compress_payload: env_flag(
                    "PUBSUB_COMPRESS_PAYLOAD",
                    defaults.message_options.compress_payload,
                )?,
                compression_threshold: env_parse(
                    "PUBSUB_COMPRESSION_THRESHOLD",
                    defaults.message_options.compression_threshold,
                )?,
            },
            retry_policy: RetryPolicyConfig {
                minimum_backoff_secs: env_parse(
                    "PUBSUB_RETRY_MINIMUM_BACKOFF",
                    defaults.retry_policy.minimum_backoff_secs,
                )?,
                maximum_backoff_secs: env_parse(
                    "PUBSUB_RETRY_MAXIMUM_BACKOFF",
                    defaults.retry_policy.maximum_backoff_secs,
                )?,
            },
            dead_letter_policy: DeadLetterConfig {
                enabled: env_flag("PUBSUB_DEAD_LETTER_ENABLED", defaults.dead_letter_policy.enabled)?,
                max_delivery_attempts: env_parse(
                    "PUBSUB_DEAD_LETTER_MAX_ATTEMPTS",
                    defaults.dead_letter_policy.max_delivery_attempts,
                )?,
                dead_letter_topic_suffix: env_or_default(
                    "PUBSUB_DEAD_LETTER_SUFFIX",
                    &defaults.dead_letter_policy.dead_letter_topic_suffix,
                ),
            },
            subscription: SubscriptionDefaults {
                ack_deadline_secs: env_parse(
                    "PUBSUB_ACK_DEADLINE",
                    defaults.subscription.ack_deadline_secs,
                )?,
                max_messages: env_parse("PUBSUB_MAX_MESSAGES", defaults.subscription.max_messages)?,
                wait_time_ms: env_parse("PUBSUB_WAIT_TIME_MS", defaults.subscription.wait_time_ms)?,
                subscription_suffix: env_or_default(
                    "PUBSUB_SUBSCRIPTION_SUFFIX",
                    &defaults.subscription.subscription_suffix,
                ),
                auto_acknowledge: env_flag(
                    "PUBSUB_AUTO_ACKNOWLEDGE",
                    defaults.subscription.auto_acknowledge,
                )?,
                nack_on_error: env_flag("PUBSUB_NACK_ON_ERROR", defaults.subscription.nack_on_error)?,
                mode,
                max_messages_per_pull: env_parse(
                    "PUBSUB_MAX_MESSAGES_PER_PULL",
                    defaults.subscription.max_messages_per_pull,
                )?,
                error_backoff_ms: env_parse(
                    "PUBSUB_ERROR_BACKOFF_MS",
                    defaults.subscription.error_backoff_ms,
                )?,
            },
            schema: SchemaConfig {
                strict_mode: env_flag("PUBSUB_SCHEMA_STRICT", false)?,
                schemas: HashMap::new(),
            },
            monitoring: MonitoringConfig {
                log_published: env_flag("PUBSUB_LOG_PUBLISHED", true)?,
                log_received: env_flag("PUBSUB_LOG_RECEIVED", true)?,
                log_failed: env_flag("PUBSUB_LOG_FAILED", true)?,
            },
            queue: QueueSettings {
                default_queue: env_or_default("PUBSUB_DEFAULT_QUEUE", &defaults.queue.default_queue),
                max_messages: env_parse("PUBSUB_QUEUE_MAX_MESSAGES", defaults.queue.max_messages)?,
            },
            events: EventSettings {
                default_topic: env_optional("PUBSUB_EVENTS_DEFAULT_TOPIC"),
                topics: HashMap::new(),
                default_source: env_optional("PUBSUB_EVENTS_SOURCE"),
            },
            webhook: WebhookSettings {
                auth_token: env_optional("PUBSUB_WEBHOOK_TOKEN"),
            },
            topics: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PubSubConfig::new("acme");
        assert!(config.auto_create_topics);
        assert!(config.subscription.auto_acknowledge);
        assert_eq!(config.message_options.compression_threshold, 1024);
        assert_eq!(config.subscription.subscription_for("orders"), "orders-subscription");
        assert_eq!(config.dead_letter_policy.topic_for("orders"), "orders-dead-letter");
        assert_eq!(config.formatter_for("orders"), FormatterKind::Json);
    }

    #[test]
    fn test_builder_and_topic_overrides() {
        let config = PubSubConfig::new("acme")
            .with_compression(true, 2048)
            .with_dead_letter(7)
            .with_subscriber_mode(SubscriberMode::Streaming)
            .with_topic(
                "events",
                TopicConfig {
                    enable_message_ordering: true,
                    schema: None,
                    formatter: Some(FormatterKind::CloudEvents),
                },
            );

        assert_eq!(config.message_options.compression_threshold, 2048);
        assert!(config.dead_letter_policy.enabled);
        assert_eq!(config.dead_letter_policy.max_delivery_attempts, 7);
        assert_eq!(config.subscription.mode, SubscriberMode::Streaming);
        assert!(config.topic("events").enable_message_ordering);
        assert!(!config.topic("other").enable_message_ordering);
        assert_eq!(config.formatter_for("events"), FormatterKind::CloudEvents);
    }

    #[test]
    fn test_validate_rejects_missing_project() {
        let err = PubSubConfig::default().validate().unwrap_err();
        assert!(matches!(err, PubSubError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_dead_letter_attempts_out_of_range() {
        let config = PubSubConfig::new("acme").with_dead_letter(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_schema_in_strict_mode() {
        let config = PubSubConfig::new("acme").with_strict_schemas(true).with_topic(
            "orders",
            TopicConfig {
                schema: Some("order".to_string()),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "project_id": "acme",
                "default_formatter": "cloud_events",
                "message_options": {{ "compression_threshold": 4096 }},
                "subscription": {{ "mode": "streaming", "ack_deadline_secs": 30 }},
                "topics": {{ "orders": {{ "enable_message_ordering": true, "schema": "order" }} }},
                "schema": {{ "schemas": {{ "order": {{ "file": "schemas/order.json" }} }} }}
            }}"#
        )
        .unwrap();

        let config = PubSubConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.project_id, "acme");
        assert_eq!(config.default_formatter, FormatterKind::CloudEvents);
        assert_eq!(config.message_options.compression_threshold, 4096);
        assert!(config.message_options.compress_payload);
        assert_eq!(config.subscription.mode, SubscriberMode::Streaming);
        assert_eq!(config.subscription.ack_deadline_secs, 30);
        assert_eq!(config.topic("orders").schema.as_deref(), Some("order"));
        assert!(matches!(
            config.schema.schemas.get("order"),
            Some(SchemaSource::File(_))
        ));
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = PubSubConfig::from_json_file("/nonexistent/pubsub.json").unwrap_err();
        assert!(matches!(err, PubSubError::Configuration(_)));
    }

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("PUBSUB_PROJECT_ID", Some("acme")),
                ("PUBSUB_AUTH_METHOD", None),
                ("PUBSUB_KEY_FILE", None),
                ("GOOGLE_APPLICATION_CREDENTIALS", None),
                ("PUBSUB_COMPRESSION_THRESHOLD", Some("512")),
                ("PUBSUB_DEAD_LETTER_ENABLED", Some("true")),
                ("PUBSUB_SUBSCRIBER_MODE", Some("streaming")),
                ("PUBSUB_FORMATTER", Some("cloud_events")),
                ("PUBSUB_NACK_ON_ERROR", Some("1")),
            ],
            || {
                let config = PubSubConfig::from_env().unwrap();
                assert_eq!(config.project_id, "acme");
                assert_eq!(config.message_options.compression_threshold, 512);
                assert!(config.dead_letter_policy.enabled);
                assert_eq!(config.subscription.mode, SubscriberMode::Streaming);
                assert_eq!(config.default_formatter, FormatterKind::CloudEvents);
                assert!(config.subscription.nack_on_error);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_bad_mode() {
        temp_env::with_vars(
            [
                ("PUBSUB_PROJECT_ID", Some("acme")),
                ("PUBSUB_SUBSCRIBER_MODE", Some("push")),
            ],
            || {
                assert!(PubSubConfig::from_env().is_err());
            },
        );
    }
}
