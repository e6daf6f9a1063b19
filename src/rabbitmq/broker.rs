// src/rabbitmq/broker.rs
//! Transport seam between the messaging core and a concrete broker.
//!
//! [`Broker`] opens connections, [`BrokerConnection`] opens channels and
//! [`BrokerChannel`] carries every AMQP method the core needs. The lapin
//! transport lives in [`super::amqp`], the in-process emulator in
//! [`super::memory`].
//!
//! Channel methods take `&mut self` and the trait only requires `Send`, so a
//! boxed channel can move between tasks but can never be shared by two of them.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::topology::{BindingSpec, ExchangeSpec, QueueInfo, QueueSpec};
use crate::config::ConnectionConfig;
use crate::message::{ChannelId, Delivery, DeliveryTag, MessageProperties};

/// A delivery as reported by the transport, before it is tied to a [`ChannelId`].
#[derive(Clone, Debug)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl RawDelivery {
    pub fn on_channel(self, channel: ChannelId) -> Delivery {
        Delivery {
            delivery_tag: DeliveryTag {
                channel,
                tag: self.delivery_tag,
            },
            exchange: self.exchange,
            routing_key: self.routing_key,
            redelivered: self.redelivered,
            properties: self.properties,
            body: self.body,
        }
    }
}

/// Stream of deliveries produced by a `basic.consume` subscription.
pub type RawDeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Options for a `basic.consume` subscription.
#[derive(Clone, Debug, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
}

/// What the broker did with a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Confirmed,
    /// Accepted but the channel does not run in confirm mode.
    Sent,
    /// A mandatory message could not be routed and was returned.
    Returned,
    Nacked,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send {
    fn is_open(&self) -> bool;

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()>;

    async fn enable_confirms(&mut self) -> Result<()>;

    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()>;

    async fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<()>;

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueInfo>;

    /// Passive declaration; fails with NOT_FOUND if the queue is absent.
    async fn inspect_queue(&mut self, name: &str) -> Result<QueueInfo>;

    async fn bind_queue(&mut self, binding: &BindingSpec) -> Result<()>;

    async fn unbind_queue(&mut self, binding: &BindingSpec) -> Result<()>;

    async fn purge_queue(&mut self, name: &str) -> Result<u32>;

    async fn delete_queue(&mut self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome>;

    async fn get(&mut self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<RawDeliveryStream>;

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
