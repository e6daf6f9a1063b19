// src/rabbitmq/client.rs
//! `RabbitMQClient`: the single object applications use for messaging.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::amqp::AmqpBroker;
use super::broker::{Broker, ConsumeOptions};
use super::channel_manager::{ChannelConfig, ChannelHandle};
use super::connection::ConnectionManager;
use super::consumer::{consumer_tag, ConsumerHandle, ConsumerRegistry, DeliveryStream, WorkerContext};
use super::errors::Result;
use super::handler::{AutoAck, DeliveryHandler, MessageHandler};
use super::health::HealthReport;
use super::publisher::Publisher;
use super::topology::{BindingSpec, ExchangeSpec, QueueInfo, QueueSpec, TopologyConfig};
use crate::config::MessagingConfig;
use crate::message::{Delivery, DeliveryTag, MessageProperties, Payload};

/// Runs `$op` on the primary channel, reopening the channel afterwards if the
/// operation left it closed.
macro_rules! on_primary_channel {
    ($client:expr, $channel:ident => $op:expr) => {{
        let mut manager = $client.connection.lock().await;
        let result = match manager.ensure_channel().await {
            Ok($channel) => $op.await,
            Err(e) => Err(e),
        };
        manager.recover_channel(&result).await;
        result
    }};
}

pub struct RabbitMQClient {
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    connection: tokio::sync::Mutex<ConnectionManager>,
    publisher: Publisher,
    consumers: ConsumerRegistry,
}

impl RabbitMQClient {
    /// Creates a client; nothing is opened until the first operation.
    pub fn new(broker: Arc<dyn Broker>, config: MessagingConfig) -> Self {
        let manager = ConnectionManager::new(broker.clone(), config.connection.clone())
            .with_reconnect_policy(config.reconnect.clone())
            .with_channel_config(ChannelConfig::labelled("primary"));
        let publisher = Publisher::new(
            config.connection.app_id.clone(),
            config.connection.blocked_connection_timeout(),
        );

        Self {
            broker,
            config,
            connection: tokio::sync::Mutex::new(manager),
            publisher,
            consumers: ConsumerRegistry::new(),
        }
    }

    /// A client speaking AMQP to the configured RabbitMQ server.
    pub fn amqp(config: MessagingConfig) -> Self {
        Self::new(Arc::new(AmqpBroker), config)
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Connects and opens the primary channel eagerly.
    pub async fn connect(&self) -> Result<()> {
        let mut manager = self.connection.lock().await;
        manager.ensure_channel().await.map(|_| ())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_connected()
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            broker: self.broker.clone(),
            connection: self.config.connection.clone(),
            reconnect: self.config.reconnect.clone(),
            prefetch_count: self.config.consumer.prefetch_count,
        }
    }

    fn consumer_channel_config(&self, label: String) -> ChannelConfig {
        ChannelConfig {
            prefetch_count: self.config.consumer.prefetch_count,
            confirm_mode: false,
            label,
        }
    }

    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        on_primary_channel!(self, channel => channel.declare_exchange(spec))
    }

    /// Returns the actual queue name, which the broker picks when `spec.name` is empty.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        on_primary_channel!(self, channel => channel.declare_queue(spec))
    }

    pub async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        on_primary_channel!(self, channel => channel.bind_queue(binding))
    }

    pub async fn unbind_queue(&self, binding: &BindingSpec) -> Result<()> {
        on_primary_channel!(self, channel => channel.unbind_queue(binding))
    }

    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Payload,
        properties: Option<MessageProperties>,
        mandatory: bool,
    ) -> Result<()> {
        on_primary_channel!(self, channel => self.publisher.publish(
            channel,
            exchange,
            routing_key,
            message,
            properties,
            mandatory,
        ))
    }

    pub async fn publish_to_queue(
        &self,
        queue: &str,
        message: &Payload,
        properties: Option<MessageProperties>,
    ) -> Result<()> {
        on_primary_channel!(self, channel => self.publisher.publish_to_queue(channel, queue, message, properties))
    }

    pub async fn get_message(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>> {
        on_primary_channel!(self, channel => channel.get_message(queue, auto_ack))
    }

    /// Acknowledges a delivery obtained from [`get_message`](Self::get_message).
    /// Tags issued by an earlier primary channel are rejected.
    pub async fn ack_message(&self, tag: DeliveryTag) -> Result<()> {
        on_primary_channel!(self, channel => channel.ack(tag))
    }

    pub async fn nack_message(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        on_primary_channel!(self, channel => channel.nack(tag, requeue))
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<u32> {
        on_primary_channel!(self, channel => channel.purge_queue(queue))
    }

    pub async fn delete_queue(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        on_primary_channel!(self, channel => channel.delete_queue(queue, if_unused, if_empty))
    }

    pub async fn delete_exchange(&self, exchange: &str, if_unused: bool) -> Result<()> {
        on_primary_channel!(self, channel => channel.delete_exchange(exchange, if_unused))
    }

    /// Passive lookup; `None` when the queue does not exist.
    pub async fn get_queue_info(&self, queue: &str) -> Result<Option<QueueInfo>> {
        on_primary_channel!(self, channel => channel.queue_info(queue))
    }

    /// Declares exchanges, queues and bindings in that order.
    pub async fn bootstrap_topology(&self, topology: &TopologyConfig) -> Result<()> {
        on_primary_channel!(self, channel => channel.install(topology))
    }

    /// Opens a dedicated channel on the client's connection and subscribes to
    /// `queue`. Deliveries are acknowledged through the returned channel.
    pub async fn subscribe(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<(ChannelHandle, DeliveryStream)> {
        let mut channel = {
            let mut manager = self.connection.lock().await;
            manager
                .open_dedicated_channel(self.consumer_channel_config(format!("subscriber:{}", queue)))
                .await?
        };
        let deliveries = channel.subscribe(queue, &consumer_tag(queue), options).await?;
        Ok((channel, deliveries))
    }

    /// Consumes `queue` on the caller's task until `cancel` fires, the broker
    /// cancels the subscription or the channel fails.
    pub async fn consume_messages(
        &self,
        queue: &str,
        handler: &dyn DeliveryHandler,
        options: &ConsumeOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut channel = {
            let mut manager = self.connection.lock().await;
            manager
                .open_dedicated_channel(self.consumer_channel_config(format!("blocking:{}", queue)))
                .await?
        };

        let result = channel
            .consume_messages(queue, &consumer_tag(queue), handler, options, cancel)
            .await;
        if let Err(e) = channel.close().await {
            warn!(queue = %queue, error = %e, "Failed to close consumer channel");
        }
        result
    }

    /// Starts a background worker with its own connection consuming `queue`.
    pub fn consume_messages_async(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle> {
        self.consumers
            .spawn(self.worker_context(), queue, handler, options)
    }

    /// Background consumer with manual acknowledgement handled for the caller:
    /// success acks, an explicit requeue, an error or a panic nacks with requeue.
    pub fn register_message_handler<H: MessageHandler>(
        &self,
        queue: &str,
        handler: H,
        exclusive: bool,
    ) -> Result<ConsumerHandle> {
        let options = ConsumeOptions {
            auto_ack: false,
            exclusive,
        };
        let handle = self.consume_messages_async(queue, Arc::new(AutoAck::new(queue, handler)), options)?;
        info!(queue = %queue, "Message handler registered");
        Ok(handle)
    }

    pub async fn unregister_message_handler(&self, queue: &str) -> Result<()> {
        self.stop_consumer(queue).await
    }

    pub async fn stop_consumer(&self, queue: &str) -> Result<()> {
        self.consumers
            .stop(queue, self.config.consumer.join_timeout())
            .await
    }

    pub fn active_consumers(&self) -> Vec<String> {
        self.consumers.active()
    }

    /// Reports connection and consumer state. When disconnected, makes exactly
    /// one connection attempt, ignoring the retry policy, and reports its outcome.
    pub async fn health_check(&self) -> HealthReport {
        let mut manager = self.connection.lock().await;

        if manager.is_connected() {
            return HealthReport::new(
                manager.config(),
                true,
                manager.channel_open(),
                self.consumers.active(),
            );
        }

        warn!("RabbitMQ connection is down; attempting to reconnect for health check");
        let reconnected = match manager.connect_once().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Health check reconnect failed");
                false
            }
        };

        HealthReport::new(
            manager.config(),
            manager.is_connected(),
            manager.channel_open(),
            self.consumers.active(),
        )
        .with_reconnect(reconnected)
    }

    /// Stops every background consumer, then closes the channel and the
    /// connection. Safe to call repeatedly; later operations reconnect.
    ///
    /// A consumer started while `close` runs either is stopped with the rest
    /// or, if registered after the cutoff, keeps running on the reopened client.
    pub async fn close(&self) -> Result<()> {
        let stuck = self
            .consumers
            .shutdown(self.config.consumer.join_timeout())
            .await;
        if !stuck.is_empty() {
            warn!(queues = ?stuck, "Some consumers were still running at close");
        }

        let mut manager = self.connection.lock().await;
        manager.close().await?;
        info!("RabbitMQ client closed");
        Ok(())
    }
}
