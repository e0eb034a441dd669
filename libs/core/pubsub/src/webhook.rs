//! Push delivery endpoint.
//!
//! The service POSTs one envelope per message:
//!
//! ```json
//! {"message": {"messageId": "1", "data": "<base64>", "attributes": {}, "publishTime": "..."},
//!  "subscription": "projects/p/subscriptions/s"}
//! ```
//!
//! Every authenticated request is answered 200, whatever the handler chain
//! did: failures go to the subscriber's error handler and the message is
//! acknowledged anyway. A missing or wrong bearer token gets 401.

use crate::error::PubSubError;
use crate::subscriber::Subscriber;
use crate::transport::ReceivedMessage;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Push request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
    #[serde(default)]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(alias = "message_id")]
    pub message_id: String,
    /// Base64 payload
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, alias = "publish_time")]
    pub publish_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "ordering_key")]
    pub ordering_key: Option<String>,
}

impl PushEnvelope {
    /// Transport-level view of the pushed message.
    pub fn into_received(self) -> Result<ReceivedMessage, PubSubError> {
        let data = STANDARD.decode(self.message.data.as_bytes()).map_err(|e| {
            PubSubError::MessageConversion(format!(
                "message {} data is not base64: {}",
                self.message.message_id, e
            ))
        })?;
        Ok(ReceivedMessage {
            ack_id: self.message.message_id.clone(),
            id: self.message.message_id,
            data,
            attributes: self.message.attributes,
            ordering_key: self.message.ordering_key.filter(|k| !k.is_empty()),
            publish_time: self.message.publish_time.unwrap_or_else(Utc::now),
            delivery_attempt: self.delivery_attempt,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PushResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl PushResponse {
    fn new(status: &str, message_id: Option<String>) -> Self {
        Self {
            status: status.to_string(),
            message_id,
        }
    }
}

struct WebhookState {
    subscriber: Subscriber,
    auth_token: Option<String>,
}

type SharedWebhookState = Arc<WebhookState>;

/// Router serving `POST /` for pushes and `GET /health`. The subscriber's
/// handler chain and error handler process every message; when no token is
/// given, `webhook.auth_token` from its configuration applies.
pub fn router(subscriber: Subscriber, auth_token: Option<String>) -> Router {
    let auth_token = auth_token.or_else(|| subscriber.config().webhook.auth_token.clone());
    let state = Arc::new(WebhookState {
        subscriber,
        auth_token,
    });
    Router::new()
        .route("/", post(receive_push))
        .route("/health", get(health))
        .with_state(state)
}

fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == expected)
}

#[instrument(skip_all)]
async fn receive_push(
    State(state): State<SharedWebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !authorized(&headers, state.auth_token.as_deref()) {
        warn!("Push rejected: bad or missing bearer token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(PushResponse::new("unauthorized", None)),
        );
    }

    let received = serde_json::from_slice::<PushEnvelope>(&body)
        .map_err(|e| PubSubError::Format(format!("invalid push envelope: {}", e)))
        .and_then(PushEnvelope::into_received);

    let received = match received {
        Ok(received) => received,
        Err(e) => {
            state.subscriber.report_error(&e);
            return (StatusCode::OK, Json(PushResponse::new("error", None)));
        }
    };

    let message_id = received.id.clone();
    let status = match state.subscriber.process_pushed(&received).await {
        Some(_) => {
            info!(message_id = %message_id, "Push message processed");
            "ok"
        }
        None => "error",
    };
    (StatusCode::OK, Json(PushResponse::new(status, Some(message_id))))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PubSubConfig;
    use crate::error::BoxError;
    use crate::handler::{ErrorContext, handler_fn};
    use crate::message::DecodedMessage;
    use crate::transport::MockTransport;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tower::ServiceExt;

    async fn json_body<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn push_request(body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn envelope(data: &[u8]) -> Value {
        json!({
            "message": {
                "messageId": "m-1",
                "data": STANDARD.encode(data),
                "attributes": { "origin": "test" },
                "publishTime": "2024-05-01T10:00:00Z"
            },
            "subscription": "projects/acme/subscriptions/orders-subscription"
        })
    }

    fn subscriber() -> Subscriber {
        Subscriber::new(
            Arc::new(MockTransport::new()),
            Arc::new(PubSubConfig::new("acme")),
            "orders-subscription",
        )
    }

    #[tokio::test]
    async fn test_push_runs_handler_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let app = router(
            subscriber().with_handler(handler_fn("record", move |m: DecodedMessage| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(m.payload.clone());
                    Ok::<_, BoxError>(m.payload)
                }
            })),
            None,
        );

        let response = app
            .oneshot(push_request(envelope(br#"{"order_id":123}"#), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: PushResponse = json_body(response.into_body()).await;
        assert_eq!(body, PushResponse::new("ok", Some("m-1".into())));
        assert_eq!(seen.lock().unwrap().as_slice(), [json!({ "order_id": 123 })]);
    }

    #[tokio::test]
    async fn test_handler_failure_still_returns_200() {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        let app = router(
            subscriber()
                .with_handler(handler_fn("fail", |_m: DecodedMessage| async move {
                    Err::<Value, BoxError>("nope".into())
                }))
                .with_error_handler(move |e: &PubSubError, _: &ErrorContext| {
                    sink.lock().unwrap().push(e.kind())
                }),
            None,
        );

        let response = app.oneshot(push_request(envelope(b"{}"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(kinds.lock().unwrap().as_slice(), ["handler"]);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_acknowledged() {
        let app = router(subscriber(), None);
        let response = app
            .oneshot(push_request(json!({ "unexpected": true }), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: PushResponse = json_body(response.into_body()).await;
        assert_eq!(body.status, "error");
    }

    #[tokio::test]
    async fn test_bearer_token_required_when_configured() {
        let app = router(subscriber(), Some("s3cret".into()));

        let missing = app
            .clone()
            .oneshot(push_request(envelope(b"{}"), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(push_request(envelope(b"{}"), Some("guess")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .oneshot(push_request(envelope(b"{}"), Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[test]
    fn test_envelope_conversion() {
        let envelope: PushEnvelope = serde_json::from_value(json!({
            "message": { "messageId": "7", "data": STANDARD.encode("hi"), "orderingKey": "" },
            "deliveryAttempt": 3
        }))
        .unwrap();
        let received = envelope.into_received().unwrap();
        assert_eq!(received.data, b"hi");
        assert_eq!(received.ordering_key, None);
        assert_eq!(received.delivery_attempt, Some(3));

        let bad: PushEnvelope =
            serde_json::from_value(json!({ "message": { "messageId": "8", "data": "%%%" } })).unwrap();
        assert!(matches!(bad.into_received(), Err(PubSubError::MessageConversion(_))));
    }
}
