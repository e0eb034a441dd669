//! Message and error handler traits.

use crate::error::{BoxError, PubSubError};
use crate::message::DecodedMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;

/// Outcome of one handler.
pub type HandlerResult = Result<Value, BoxError>;

/// Handles decoded messages.
///
/// Handlers registered on a subscriber run in registration order. The value
/// returned by the last handler is the message's result; an error stops the
/// chain for that message only.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &DecodedMessage) -> HandlerResult;

    /// Used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Handler built from an async closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`]. The closure receives an
/// owned copy of the message.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(DecodedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(DecodedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: &DecodedMessage) -> HandlerResult {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Where a consume-path error happened.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub subscription: String,
    pub message_id: Option<String>,
    pub attributes: HashMap<String, String>,
    /// Present when the failure happened after decoding
    pub payload: Option<Value>,
}

impl ErrorContext {
    pub fn for_subscription(subscription: &str) -> Self {
        Self {
            subscription: subscription.to_string(),
            ..Default::default()
        }
    }
}

/// Receives consume-path errors. One per subscriber.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &PubSubError, context: &ErrorContext);
}

impl<F> ErrorHandler for F
where
    F: Fn(&PubSubError, &ErrorContext) + Send + Sync,
{
    fn on_error(&self, error: &PubSubError, context: &ErrorContext) {
        self(error, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn message() -> DecodedMessage {
        DecodedMessage {
            id: "1".into(),
            ack_id: "a".into(),
            subscription: "s".into(),
            payload: json!({ "n": 2 }),
            attributes: HashMap::new(),
            compressed: false,
            ordering_key: None,
            publish_time: Utc::now(),
            delivery_attempt: None,
        }
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let doubler = handler_fn("doubler", |m: DecodedMessage| async move {
            let n = m.payload["n"].as_i64().ok_or("missing n")?;
            Ok::<_, BoxError>(json!(n * 2))
        });
        assert_eq!(doubler.name(), "doubler");
        assert_eq!(doubler.handle(&message()).await.unwrap(), json!(4));
    }

    #[test]
    fn test_closure_error_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |error: &PubSubError, context: &ErrorContext| {
            sink.lock().unwrap().push((error.kind(), context.subscription.clone()));
        };

        handler.on_error(
            &PubSubError::Format("bad".into()),
            &ErrorContext::for_subscription("orders-subscription"),
        );
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("format", "orders-subscription".to_string())]
        );
    }
}
