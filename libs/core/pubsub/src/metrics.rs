//! Prometheus metrics for publishing and consuming.

use metrics::{counter, histogram};
use std::time::Duration;

/// Metrics handle labelled with the app name.
#[derive(Debug, Clone)]
pub struct PubSubMetrics {
    app_name: String,
}

impl PubSubMetrics {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }

    /// Record messages published to a topic.
    pub fn published(&self, topic: &str, count: usize, duration: Duration) {
        counter!(
            "pubsub_messages_published_total",
            "app" => self.app_name.clone(),
            "topic" => topic.to_string()
        )
        .increment(count as u64);

        histogram!(
            "pubsub_publish_duration_seconds",
            "app" => self.app_name.clone(),
            "topic" => topic.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a rejected or failed publish.
    pub fn publish_failed(&self, topic: &str, kind: &str) {
        counter!(
            "pubsub_publish_failures_total",
            "app" => self.app_name.clone(),
            "topic" => topic.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record messages returned by a pull.
    pub fn received(&self, subscription: &str, count: usize) {
        counter!(
            "pubsub_messages_received_total",
            "app" => self.app_name.clone(),
            "subscription" => subscription.to_string()
        )
        .increment(count as u64);
    }

    /// Record a message that made it through the handler chain.
    pub fn processed(&self, subscription: &str, duration: Duration) {
        counter!(
            "pubsub_messages_processed_total",
            "app" => self.app_name.clone(),
            "subscription" => subscription.to_string()
        )
        .increment(1);

        histogram!(
            "pubsub_message_duration_seconds",
            "app" => self.app_name.clone(),
            "subscription" => subscription.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message that failed decoding or handling.
    pub fn failed(&self, subscription: &str, kind: &str) {
        counter!(
            "pubsub_messages_failed_total",
            "app" => self.app_name.clone(),
            "subscription" => subscription.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn acked(&self, subscription: &str, count: usize) {
        counter!(
            "pubsub_messages_acked_total",
            "app" => self.app_name.clone(),
            "subscription" => subscription.to_string()
        )
        .increment(count as u64);
    }

    pub fn nacked(&self, subscription: &str, count: usize) {
        counter!(
            "pubsub_messages_nacked_total",
            "app" => self.app_name.clone(),
            "subscription" => subscription.to_string()
        )
        .increment(count as u64);
    }
}

/// Install the Prometheus recorder and return its render handle.
pub fn init_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
}
