//! Pub/Sub CLI
//!
//! Publishes, pulls and validates messages, provisions topics and
//! subscriptions, and serves the push endpoint.
//!
//! Configuration comes from a JSON file (`--config`) or `PUBSUB_*`
//! environment variables. Set `PUBSUB_EMULATOR_HOST` to work against the
//! local emulator.

use clap::{Parser, Subcommand};
use core_config::Environment;
use core_config::tracing::{init_tracing, install_color_eyre};
use eyre::{Result, WrapErr, eyre};
use pubsub::provision;
use pubsub::subscriber::{ListenOptions, StopCondition};
use pubsub::{
    BoxError, DecodedMessage, FromEnv, MessageConsumer, PubSubConfig, PubSubManager,
    PublishOptions, handler_fn,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "pubsub")]
#[command(about = "Publish and consume messages through the pubsub messaging layer")]
struct Cli {
    /// JSON configuration file; environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one JSON payload
    Publish {
        topic: String,

        /// JSON payload
        data: String,

        /// Extra attribute, repeatable
        #[arg(short, long = "attribute", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,

        #[arg(short, long)]
        ordering_key: Option<String>,

        /// Force compression regardless of size
        #[arg(long)]
        compress: bool,
    },

    /// Pull one batch and print the payloads
    Pull {
        topic: String,

        #[arg(short, long, default_value_t = 10)]
        max_messages: usize,

        /// Print without acknowledging
        #[arg(long)]
        no_ack: bool,
    },

    /// Consume until Ctrl-C, printing each payload
    Listen {
        topic: String,

        #[arg(short, long)]
        max_messages: Option<usize>,
    },

    /// Check a JSON payload against a configured schema
    Validate {
        schema: String,

        /// JSON payload
        data: String,
    },

    /// Create a topic unless it exists
    CreateTopic {
        topic: String,

        /// Enable message ordering
        #[arg(long)]
        ordering: bool,
    },

    /// Create a subscription (and its dead-letter topic) unless it exists
    CreateSubscription {
        topic: String,

        /// Subscription name; `{topic}{subscription_suffix}` by default
        #[arg(short, long)]
        subscription: Option<String>,
    },

    /// Serve the push endpoint for a topic's subscription
    Serve {
        topic: String,

        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,

        /// Bearer token push requests must carry
        #[arg(short, long)]
        token: Option<String>,
    },
}

fn parse_attribute(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).wrap_err("payload is not valid JSON")
}

fn load_config(path: Option<&PathBuf>) -> Result<PubSubConfig> {
    match path {
        Some(path) => Ok(PubSubConfig::from_json_file(path)?),
        None => Ok(PubSubConfig::from_env()?),
    }
}

fn print_payload(payload: &Value) -> Result<()> {
    println!("{}", serde_json::to_string(payload)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let manager = Arc::new(PubSubManager::connect(config).await?);

    match cli.command {
        Commands::Publish {
            topic,
            data,
            attributes,
            ordering_key,
            compress,
        } => {
            let payload = parse_json(&data)?;
            let options = PublishOptions {
                ordering_key,
                compress: compress.then_some(true),
                ..Default::default()
            };
            let id = manager
                .publisher(None)?
                .publish(&topic, &payload, attributes.into_iter().collect::<HashMap<_, _>>(), options)
                .await?;
            println!("{}", id);
        }

        Commands::Pull {
            topic,
            max_messages,
            no_ack,
        } => {
            let subscriber = manager.subscriber(&topic, None)?;
            if no_ack {
                for message in subscriber.receive(max_messages).await? {
                    print_payload(&message.payload)?;
                }
            } else {
                for payload in subscriber.pull(max_messages).await? {
                    print_payload(&payload)?;
                }
            }
        }

        Commands::Listen { topic, max_messages } => {
            let mut consumer = manager.consumer(&topic, None)?;
            consumer.add_handler(Arc::new(handler_fn("print", |m: DecodedMessage| async move {
                println!("{}", m.payload);
                Ok::<_, BoxError>(m.payload)
            })));

            let stop = StopCondition::on_shutdown(manager.shutdown_signal());
            let signal_manager = manager.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    signal_manager.shutdown();
                }
            });

            let mut options = ListenOptions::until(stop);
            options.max_messages = max_messages;
            let stats = consumer.consume(options).await?;
            info!(
                processed = stats.processed,
                failed = stats.failed,
                "Listener finished"
            );
        }

        Commands::Validate { schema, data } => {
            let payload = parse_json(&data)?;
            let connection = manager.connection(None)?;
            match connection.validator().get_errors(&payload, &schema).await? {
                None => println!("valid"),
                Some(errors) => {
                    println!("{}", serde_json::to_string_pretty(&errors)?);
                    return Err(eyre!("payload does not satisfy schema '{}'", schema));
                }
            }
        }

        Commands::CreateTopic { topic, ordering } => {
            let connection = manager.connection(None)?;
            let mut options = provision::topic_options(connection.config(), &topic);
            options.message_ordering |= ordering;
            let created = provision::ensure_topic(connection.transport(), &topic, &options).await?;
            println!("{}", if created { "created" } else { "exists" });
        }

        Commands::CreateSubscription { topic, subscription } => {
            let connection = manager.connection(None)?;
            let config = connection.config();
            let transport = connection.transport();
            let subscription =
                subscription.unwrap_or_else(|| config.subscription.subscription_for(&topic));

            provision::ensure_topic(transport, &topic, &provision::topic_options(config, &topic)).await?;
            if config.dead_letter_policy.enabled {
                provision::ensure_topic(
                    transport,
                    &config.dead_letter_policy.topic_for(&topic),
                    &Default::default(),
                )
                .await?;
            }
            let options = provision::subscription_options(config, &topic);
            let created = provision::ensure_subscription(transport, &subscription, &options).await?;
            println!("{} {}", subscription, if created { "created" } else { "exists" });
        }

        Commands::Serve { topic, addr, token } => {
            let metrics = pubsub::init_metrics().wrap_err("cannot install metrics recorder")?;
            let subscriber = manager.subscriber(&topic, None)?.with_handler(handler_fn(
                "log",
                |m: DecodedMessage| async move {
                    info!(message_id = %m.id, payload = %m.payload, "Push received");
                    Ok::<_, BoxError>(m.payload)
                },
            ));

            let app = pubsub::webhook::router(subscriber, token).route(
                "/metrics",
                axum::routing::get(move || {
                    let metrics = metrics.clone();
                    async move { metrics.render() }
                }),
            );

            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %addr, topic = %topic, "Push endpoint listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attribute() {
        assert_eq!(
            parse_attribute("tenant=acme").unwrap(),
            ("tenant".to_string(), "acme".to_string())
        );
        assert_eq!(
            parse_attribute("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert!(parse_attribute("novalue").is_err());
        assert!(parse_attribute("=x").is_err());
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::parse_from([
            "pubsub",
            "publish",
            "orders",
            r#"{"order_id":123}"#,
            "-a",
            "tenant=acme",
            "--ordering-key",
            "customer-1",
        ]);
        match cli.command {
            Commands::Publish {
                topic,
                attributes,
                ordering_key,
                compress,
                ..
            } => {
                assert_eq!(topic, "orders");
                assert_eq!(attributes, vec![("tenant".to_string(), "acme".to_string())]);
                assert_eq!(ordering_key.as_deref(), Some("customer-1"));
                assert!(!compress);
            }
            _ => panic!("expected publish"),
        }
    }
}
