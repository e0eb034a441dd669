//! Publish/subscribe flows against the in-memory transport
//!
//! These tests drive the public API end to end:
//! - Publisher formatting, compression and schema gating
//! - Subscriber provisioning, handler chains and acknowledgement
//! - Ordering keys and dead-letter forwarding as delivered by the transport

use pubsub::config::TopicConfig;
use pubsub::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn setup(config: PubSubConfig) -> (Arc<InMemoryTransport>, Arc<PubSubConfig>, Arc<Publisher>) {
    let transport = Arc::new(InMemoryTransport::new());
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let config = Arc::new(config);
    let validator = Arc::new(SchemaValidator::from_config(&config.schema));
    let publisher = Arc::new(Publisher::new(dyn_transport, config.clone(), validator));
    (transport, config, publisher)
}

fn subscriber(transport: &Arc<InMemoryTransport>, config: &Arc<PubSubConfig>, topic: &str) -> Subscriber {
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    Subscriber::for_topic(dyn_transport, config.clone(), topic)
}

#[tokio::test]
async fn test_plain_publish_sends_payload_bytes() {
    let (transport, _, publisher) = setup(PubSubConfig::new("acme"));

    let id = publisher
        .publish("orders", &json!({ "order_id": 123 }), HashMap::new(), PublishOptions::default())
        .await
        .unwrap();

    let sent = transport.published("orders").await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data, br#"{"order_id":123}"#.to_vec());
    assert!(!sent[0].attributes.contains_key("compressed"));
    assert_eq!(sent[0].ordering_key, None);
    assert_eq!(id, "1");
    assert_eq!(transport.calls().publish, 1);
}

#[tokio::test]
async fn test_large_payload_is_compressed_and_restored() {
    let (transport, config, publisher) = setup(PubSubConfig::new("acme").with_compression(true, 1024));
    let subscriber = subscriber(&transport, &config, "orders");
    subscriber.ensure_subscription().await.unwrap();

    let large = Value::String("x".repeat(2000));
    publisher
        .publish("orders", &large, HashMap::new(), PublishOptions::default())
        .await
        .unwrap();

    let sent = transport.published("orders").await;
    assert_eq!(sent[0].attributes["compressed"], "true");
    assert!(sent[0].data.len() < 2000);

    let received = subscriber.pull(10).await.unwrap();
    assert_eq!(received, vec![large]);
}

#[tokio::test]
async fn test_empty_pull_runs_no_handler_and_acks_nothing() {
    let (transport, config, _) = setup(PubSubConfig::new("acme"));
    let invoked = Arc::new(Mutex::new(0));
    let counter = invoked.clone();
    let subscriber = subscriber(&transport, &config, "orders").with_handler(handler_fn(
        "count",
        move |m: DecodedMessage| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok::<_, BoxError>(m.payload)
            }
        },
    ));

    let results = subscriber.pull(10).await.unwrap();

    assert!(results.is_empty());
    assert_eq!(*invoked.lock().unwrap(), 0);
    assert_eq!(transport.calls().acknowledge, 0);
}

#[tokio::test]
async fn test_handler_chain_results_and_acknowledgement() {
    let (transport, config, publisher) = setup(PubSubConfig::new("acme"));
    let subscriber = subscriber(&transport, &config, "orders")
        .with_handler(handler_fn("double", |m: DecodedMessage| async move {
            let n = m.payload["order_id"].as_i64().unwrap_or_default();
            Ok::<_, BoxError>(json!(n * 2))
        }));
    subscriber.ensure_subscription().await.unwrap();

    publisher
        .publish("orders", &json!({ "order_id": 21 }), HashMap::new(), PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(subscriber.pull(10).await.unwrap(), vec![json!(42)]);
    assert_eq!(transport.in_flight_len("orders-subscription").await, 0);
    assert_eq!(transport.backlog_len("orders-subscription").await, 0);
}

#[tokio::test]
async fn test_ordering_key_is_propagated_and_respected() {
    let config = PubSubConfig::new("acme").with_topic(
        "orders",
        TopicConfig {
            enable_message_ordering: true,
            ..Default::default()
        },
    );
    let (transport, config, publisher) = setup(config);
    let subscriber = subscriber(&transport, &config, "orders");
    subscriber.ensure_subscription().await.unwrap();

    for step in 1..=3 {
        publisher
            .publish(
                "orders",
                &json!({ "step": step }),
                HashMap::new(),
                PublishOptions::default().with_ordering_key("customer-1"),
            )
            .await
            .unwrap();
    }

    let sent = transport.published("orders").await;
    assert!(sent.iter().all(|m| m.ordering_key.as_deref() == Some("customer-1")));

    // One message per key is in flight at a time; each pull acks it.
    for step in 1..=3 {
        assert_eq!(subscriber.pull(10).await.unwrap(), vec![json!({ "step": step })]);
    }
}

#[tokio::test]
async fn test_failing_messages_end_up_on_dead_letter_topic() {
    let (transport, config, publisher) = setup(PubSubConfig::new("acme").with_dead_letter(5));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(0));
    let (attempt_sink, error_sink) = (attempts.clone(), errors.clone());
    let subscriber = subscriber(&transport, &config, "orders")
        .with_nack_on_error(true)
        .with_handler(handler_fn("reject", move |m: DecodedMessage| {
            let attempt_sink = attempt_sink.clone();
            async move {
                attempt_sink.lock().unwrap().push(m.delivery_attempt);
                Err::<Value, BoxError>("cannot process".into())
            }
        }))
        .with_error_handler(move |e: &PubSubError, _: &ErrorContext| {
            assert_eq!(e.kind(), "handler");
            *error_sink.lock().unwrap() += 1;
        });
    subscriber.ensure_subscription().await.unwrap();

    let dead_letters = self::subscriber(&transport, &config, "orders-dead-letter");
    dead_letters.ensure_subscription().await.unwrap();

    publisher
        .publish("orders", &json!({ "order_id": 9 }), HashMap::new(), PublishOptions::default())
        .await
        .unwrap();

    // Five failed deliveries, then the sixth attempt is forwarded.
    for _ in 0..6 {
        assert!(subscriber.pull(10).await.unwrap().is_empty());
    }

    assert_eq!(
        attempts.lock().unwrap().as_slice(),
        [Some(1), Some(2), Some(3), Some(4), Some(5)]
    );
    assert_eq!(*errors.lock().unwrap(), 5);
    assert_eq!(dead_letters.pull(10).await.unwrap(), vec![json!({ "order_id": 9 })]);
}

#[tokio::test]
async fn test_schema_gates_publishing() {
    let config = PubSubConfig::new("acme")
        .with_schema(
            "order",
            SchemaSource::Inline(json!({
                "type": "object",
                "required": ["order_id"],
                "properties": { "order_id": { "type": "integer", "minimum": 1 } }
            })),
        )
        .with_topic(
            "orders",
            TopicConfig {
                schema: Some("order".into()),
                ..Default::default()
            },
        );
    let (transport, _, publisher) = setup(config);

    let err = publisher
        .publish("orders", &json!({ "order_id": 0 }), HashMap::new(), PublishOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "schema_validation");
    assert!(err.validation_errors().unwrap().get("order_id").is_some());
    assert!(transport.published("orders").await.is_empty());

    publisher
        .publish("orders", &json!({ "order_id": 7 }), HashMap::new(), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.published("orders").await.len(), 1);
}

#[tokio::test]
async fn test_cloud_events_round_trip() {
    let config = PubSubConfig::new("acme")
        .with_app_name("shop")
        .with_default_formatter(FormatterKind::CloudEvents);
    let (transport, config, publisher) = setup(config);
    let subscriber = subscriber(&transport, &config, "orders");
    subscriber.ensure_subscription().await.unwrap();

    publisher
        .publish("orders", &json!({ "order_id": 5 }), HashMap::new(), PublishOptions::default())
        .await
        .unwrap();

    let envelope: Value = serde_json::from_slice(&transport.published("orders").await[0].data).unwrap();
    assert_eq!(envelope["spec_version"], "1.0");
    assert_eq!(envelope["data"], json!({ "order_id": 5 }));

    assert_eq!(subscriber.pull(10).await.unwrap(), vec![json!({ "order_id": 5 })]);
}

#[tokio::test]
async fn test_batch_publish_returns_ids_in_order() {
    let (transport, _, publisher) = setup(PubSubConfig::new("acme"));

    let ids = publisher
        .publish_batch(
            "orders",
            vec![
                BatchMessage::new(json!({ "n": 1 })),
                BatchMessage::new(json!({ "n": 2 })).with_attribute("priority", "high"),
            ],
            PublishOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(ids, vec!["1", "2"]);
    let sent = transport.published("orders").await;
    assert_eq!(sent[1].attributes["priority"], "high");
    assert_eq!(transport.calls().publish, 1);
}
