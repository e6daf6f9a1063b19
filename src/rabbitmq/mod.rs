// src/rabbitmq/mod.rs
// RabbitMQ messaging: transports, connection management, topology, publishing
// and consumption behind one client facade.

pub mod errors;
pub mod broker;
pub mod amqp;
pub mod memory;
pub mod connection;
pub mod channel_manager;
pub mod topology;
pub mod publisher;
pub mod handler;
pub mod consumer;
pub mod health;
pub mod client;

pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerChannel, BrokerConnection, ConsumeOptions, PublishOutcome};
pub use channel_manager::{ChannelConfig, ChannelHandle};
pub use client::RabbitMQClient;
pub use connection::ConnectionManager;
pub use consumer::{ConsumerHandle, ConsumerRegistry, DeliveryStream};
pub use errors::{MessagingError, Result};
pub use handler::{AckChannel, AutoAck, DeliveryHandler, HandlerOutcome, MessageHandler};
pub use health::{ConnectionSummary, HealthReport, HealthStatus};
pub use memory::InMemoryBroker;
pub use publisher::Publisher;
pub use topology::{BindingSpec, ExchangeSpec, ExchangeType, QueueInfo, QueueSpec, TopologyConfig};
