//! Pub/Sub REST v1 transport.
//!
//! Resource names passed to the transport are short names (`orders`); they
//! are expanded to `projects/{project}/topics/orders` and
//! `projects/{project}/subscriptions/orders-subscription`. Names that already
//! start with `projects/` are used as given.
//!
//! Authentication depends on the connection settings:
//! - emulator host set: no credentials, plain HTTP
//! - key file: service-account JWT exchanged for an access token
//! - application default: `GOOGLE_OAUTH_ACCESS_TOKEN`, else the metadata server

use super::{
    DeadLetterPolicy, OutboundMessage, PullOptions, ReceivedMessage, RetryPolicy,
    SubscriptionInfo, SubscriptionOptions, TopicOptions, Transport,
};
use crate::error::{PubSubError, TransportError, TransportErrorKind};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use core_config::pubsub::{CredentialsMethod, PubSubConnectionConfig};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

const API_URL: &str = "https://pubsub.googleapis.com/v1";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
/// Refresh tokens this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Service account key file contents.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    /// RSA private key in PEM format
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    TOKEN_URL.to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

/// Where access tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// No `Authorization` header (emulator)
    None,
    /// Fixed bearer token
    Static(String),
    /// Signed JWT exchanged at the key's token endpoint
    ServiceAccount(ServiceAccountKey),
    /// GCE/GKE metadata server
    Metadata,
}

impl TokenSource {
    /// Pick a source for the connection settings. Reads the key file when one
    /// is configured.
    pub async fn from_connection(config: &PubSubConnectionConfig) -> Result<Self, PubSubError> {
        if config.uses_emulator() {
            return Ok(TokenSource::None);
        }
        match &config.credentials {
            CredentialsMethod::KeyFile(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    PubSubError::configuration(format!(
                        "cannot read key file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                let key = serde_json::from_str(&raw).map_err(|e| {
                    PubSubError::configuration(format!(
                        "invalid key file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(TokenSource::ServiceAccount(key))
            }
            CredentialsMethod::ApplicationDefault => Ok(core_config::env_optional(
                "GOOGLE_OAUTH_ACCESS_TOKEN",
            )
            .map(TokenSource::Static)
            .unwrap_or(TokenSource::Metadata)),
        }
    }
}

/// [`Transport`] over the Pub/Sub REST API.
pub struct RestTransport {
    project_id: String,
    base_url: String,
    client: Client,
    tokens: TokenSource,
    token_cache: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTransport")
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestTransport {
    pub fn new(project_id: impl Into<String>, base_url: impl Into<String>, tokens: TokenSource) -> Self {
        Self {
            project_id: project_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            tokens,
            token_cache: RwLock::new(None),
        }
    }

    /// Transport for the connection settings: emulator over plain HTTP,
    /// otherwise the public endpoint with credentials.
    pub async fn connect(config: &PubSubConnectionConfig) -> Result<Self, PubSubError> {
        config.validate()?;
        let base_url = match &config.emulator_host {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                format!("{}/v1", host.trim_end_matches('/'))
            }
            Some(host) => format!("http://{}/v1", host),
            None => API_URL.to_string(),
        };
        let tokens = TokenSource::from_connection(config).await?;
        debug!(project_id = %config.project_id, base_url = %base_url, "REST transport configured");
        Ok(Self::new(config.project_id.clone(), base_url, tokens))
    }

    fn topic_path(&self, topic: &str) -> String {
        resource_path(&self.project_id, "topics", topic)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        resource_path(&self.project_id, "subscriptions", subscription)
    }

    async fn access_token(&self) -> Result<Option<String>, TransportError> {
        match &self.tokens {
            TokenSource::None => return Ok(None),
            TokenSource::Static(token) => return Ok(Some(token.clone())),
            TokenSource::ServiceAccount(_) | TokenSource::Metadata => {}
        }

        let now = Utc::now().timestamp();
        if let Some(cached) = self.token_cache.read().await.as_ref()
            && cached.expires_at > now + TOKEN_REFRESH_MARGIN_SECS
        {
            return Ok(Some(cached.access_token.clone()));
        }

        let token = match &self.tokens {
            TokenSource::ServiceAccount(key) => self.exchange_jwt(key).await?,
            _ => self.metadata_token().await?,
        };
        let access_token = token.access_token.clone();
        *self.token_cache.write().await = Some(CachedToken {
            access_token: token.access_token,
            expires_at: now + token.expires_in,
        });
        Ok(Some(access_token))
    }

    async fn exchange_jwt(&self, key: &ServiceAccountKey) -> Result<TokenResponse, TransportError> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: key.client_email.clone(),
            scope: PUBSUB_SCOPE.to_string(),
            aud: key.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| {
                TransportError::new(TransportErrorKind::PermissionDenied, format!("invalid private key: {}", e))
            })?;
        let jwt = jsonwebtoken::encode(&header, &claims, &signing_key).map_err(|e| {
            TransportError::new(TransportErrorKind::PermissionDenied, format!("cannot sign JWT: {}", e))
        })?;

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;
        decode_response(response, "token exchange").await
    }

    async fn metadata_token(&self) -> Result<TokenResponse, TransportError> {
        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(request_error)?;
        decode_response(response, "metadata token").await
    }

    /// Send an authenticated request and decode the JSON response.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(token) = self.access_token().await? {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(request_error)?;
        debug!(method = %method, path = %path, status = %response.status(), "Pub/Sub API call");
        decode_response(response, path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        match self.call::<Value>(Method::GET, path, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn resource_path(project_id: &str, collection: &str, name: &str) -> String {
    if name.starts_with("projects/") {
        name.to_string()
    } else {
        format!("projects/{}/{}/{}", project_id, collection, name)
    }
}

/// Short name when `path` belongs to `project_id`, else the full path.
fn short_name(project_id: &str, collection: &str, path: &str) -> String {
    let prefix = format!("projects/{}/{}/", project_id, collection);
    path.strip_prefix(&prefix).unwrap_or(path).to_string()
}

fn status_kind(status: StatusCode) -> TransportErrorKind {
    match status {
        StatusCode::NOT_FOUND => TransportErrorKind::NotFound,
        StatusCode::CONFLICT => TransportErrorKind::AlreadyExists,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportErrorKind::PermissionDenied,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TransportErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => TransportErrorKind::Unavailable,
        s if s.is_server_error() => TransportErrorKind::Unavailable,
        _ => TransportErrorKind::Other,
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Unavailable
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, err.to_string())
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::new(
            status_kind(status),
            format!("{} returned {}: {}", what, status, body.trim()),
        ));
    }
    let bytes = response.bytes().await.map_err(request_error)?;
    // Empty bodies (acknowledge, modifyAckDeadline) decode as `{}`.
    let bytes = if bytes.is_empty() { &b"{}"[..] } else { &bytes[..] };
    serde_json::from_slice(bytes).map_err(|e| {
        TransportError::other(format!("{} returned an unexpected body: {}", what, e))
    })
}

/// `"600s"` / `"10.5s"` as used by the API for durations.
fn parse_duration(value: &str) -> Option<Duration> {
    let seconds: f64 = value.strip_suffix('s')?.parse().ok()?;
    (seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn format_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

fn subscription_body(topic_path: String, dead_letter_path: Option<String>, options: &SubscriptionOptions) -> Value {
    let mut body = json!({
        "topic": topic_path,
        "ackDeadlineSeconds": options.ack_deadline_secs,
        "enableMessageOrdering": options.enable_message_ordering,
    });
    if let Some(retry) = &options.retry_policy {
        body["retryPolicy"] = json!({
            "minimumBackoff": format_duration(retry.minimum_backoff),
            "maximumBackoff": format_duration(retry.maximum_backoff),
        });
    }
    if let (Some(policy), Some(path)) = (&options.dead_letter_policy, dead_letter_path) {
        body["deadLetterPolicy"] = json!({
            "deadLetterTopic": path,
            "maxDeliveryAttempts": policy.max_delivery_attempts,
        });
    }
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceived>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceived {
    ack_id: String,
    message: WireMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    ordering_key: Option<String>,
}

impl WireReceived {
    fn into_received(self) -> Result<ReceivedMessage, TransportError> {
        let data = STANDARD.decode(self.message.data.as_bytes()).map_err(|e| {
            TransportError::other(format!("message {} data is not base64: {}", self.message.message_id, e))
        })?;
        Ok(ReceivedMessage {
            id: self.message.message_id,
            ack_id: self.ack_id,
            data,
            attributes: self.message.attributes,
            ordering_key: self.message.ordering_key.filter(|k| !k.is_empty()),
            publish_time: self.message.publish_time.unwrap_or_else(Utc::now),
            delivery_attempt: self.delivery_attempt,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSubscription {
    name: String,
    topic: String,
    #[serde(default)]
    ack_deadline_seconds: Option<u32>,
    #[serde(default)]
    retry_policy: Option<WireRetryPolicy>,
    #[serde(default)]
    dead_letter_policy: Option<WireDeadLetterPolicy>,
    #[serde(default)]
    enable_message_ordering: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRetryPolicy {
    minimum_backoff: Option<String>,
    maximum_backoff: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDeadLetterPolicy {
    dead_letter_topic: String,
    #[serde(default)]
    max_delivery_attempts: Option<u32>,
}

#[async_trait]
impl Transport for RestTransport {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        self.exists(&self.topic_path(topic)).await
    }

    #[instrument(skip(self, _options))]
    async fn create_topic(&self, topic: &str, _options: &TopicOptions) -> Result<(), TransportError> {
        // Ordering is a subscription property in this API.
        self.call::<Value>(Method::PUT, &self.topic_path(topic), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn publish(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<Vec<String>, TransportError> {
        let wire: Vec<Value> = messages
            .into_iter()
            .map(|m| {
                let mut message = json!({
                    "data": STANDARD.encode(&m.data),
                    "attributes": m.attributes,
                });
                if let Some(key) = m.ordering_key {
                    message["orderingKey"] = Value::String(key);
                }
                message
            })
            .collect();

        let path = format!("{}:publish", self.topic_path(topic));
        let response: PublishResponse = self
            .call(Method::POST, &path, Some(json!({ "messages": wire })))
            .await?;
        Ok(response.message_ids)
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        self.exists(&self.subscription_path(subscription)).await
    }

    #[instrument(skip(self, options))]
    async fn create_subscription(
        &self,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<(), TransportError> {
        let dead_letter_path = options
            .dead_letter_policy
            .as_ref()
            .map(|p| self.topic_path(&p.dead_letter_topic));
        let body = subscription_body(self.topic_path(&options.topic), dead_letter_path, options);
        self.call::<Value>(Method::PUT, &self.subscription_path(subscription), Some(body))
            .await
            .map(|_| ())
    }

    async fn subscription_info(&self, subscription: &str) -> Result<SubscriptionInfo, TransportError> {
        let wire: WireSubscription = self
            .call(Method::GET, &self.subscription_path(subscription), None)
            .await?;

        let retry_policy = wire.retry_policy.map(|p| RetryPolicy {
            minimum_backoff: p
                .minimum_backoff
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(Duration::from_secs(10)),
            maximum_backoff: p
                .maximum_backoff
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(Duration::from_secs(600)),
        });
        let dead_letter_policy = wire.dead_letter_policy.map(|p| DeadLetterPolicy {
            dead_letter_topic: short_name(&self.project_id, "topics", &p.dead_letter_topic),
            max_delivery_attempts: p.max_delivery_attempts.unwrap_or(5),
        });

        Ok(SubscriptionInfo {
            name: short_name(&self.project_id, "subscriptions", &wire.name),
            options: SubscriptionOptions {
                topic: short_name(&self.project_id, "topics", &wire.topic),
                ack_deadline_secs: wire.ack_deadline_seconds.unwrap_or(10),
                retry_policy,
                dead_letter_policy,
                enable_message_ordering: wire.enable_message_ordering,
            },
        })
    }

    async fn pull(
        &self,
        subscription: &str,
        options: &PullOptions,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        let path = format!("{}:pull", self.subscription_path(subscription));
        let body = json!({
            "maxMessages": options.max_messages,
            "returnImmediately": options.return_immediately,
        });
        let response: PullResponse = self.call(Method::POST, &path, Some(body)).await?;

        let mut messages = Vec::with_capacity(response.received_messages.len());
        let mut rejected = Vec::new();
        for wire in response.received_messages {
            let ack_id = wire.ack_id.clone();
            match wire.into_received() {
                Ok(message) => messages.push(message),
                Err(e) => {
                    error!(subscription = %subscription, error = %e, "Rejecting undecodable message");
                    rejected.push(ack_id);
                }
            }
        }

        // Nack undecodable messages; redelivery counts toward dead-lettering.
        if !rejected.is_empty()
            && let Err(e) = self.modify_ack_deadline(subscription, &rejected, 0).await
        {
            warn!(subscription = %subscription, error = %e, "Failed to nack undecodable messages");
        }
        Ok(messages)
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        let path = format!("{}:acknowledge", self.subscription_path(subscription));
        self.call::<Value>(Method::POST, &path, Some(json!({ "ackIds": ack_ids })))
            .await
            .map(|_| ())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        deadline_secs: u32,
    ) -> Result<(), TransportError> {
        let path = format!("{}:modifyAckDeadline", self.subscription_path(subscription));
        let body = json!({ "ackIds": ack_ids, "ackDeadlineSeconds": deadline_secs });
        self.call::<Value>(Method::POST, &path, Some(body))
            .await
            .map(|_| ())
    }
}
