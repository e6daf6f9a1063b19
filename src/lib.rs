//! Asynchronous messaging over RabbitMQ: connection management with
//! reconnect, topology declaration, confirmed publishing, blocking and
//! background consumption with manual acknowledgement, and health reporting.
//!
//! ```no_run
//! use bizmq::{MessagingConfig, Payload, RabbitMQClient};
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = RabbitMQClient::amqp(MessagingConfig::load()?);
//! client.publish_to_queue("bizmq.business.tasks", &Payload::from(json!({"task": "sync"})), None).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod message;
pub mod rabbitmq;
pub mod telemetry;

pub use config::{ConnectionConfig, ConsumerConfig, MessagingConfig, ReconnectPolicy};
pub use message::{ChannelId, Delivery, DeliveryTag, MessageProperties, Payload};
pub use rabbitmq::{
    BindingSpec, ConsumeOptions, DeliveryHandler, ExchangeSpec, ExchangeType, HandlerOutcome,
    HealthReport, InMemoryBroker, MessageHandler, MessagingError, QueueInfo, QueueSpec,
    RabbitMQClient, TopologyConfig,
};
