// src/rabbitmq/handler.rs
//! Handler traits invoked by the consume loop.

use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, warn};

use super::channel_manager::ChannelHandle;
use super::errors::Result;
use crate::message::{ChannelId, Delivery, DeliveryTag, MessageProperties, Payload};

/// Acknowledgement access to the channel a delivery arrived on.
pub struct AckChannel<'a> {
    channel: &'a mut ChannelHandle,
}

impl<'a> AckChannel<'a> {
    pub(crate) fn new(channel: &'a mut ChannelHandle) -> Self {
        Self { channel }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.channel.ack(tag).await
    }

    pub async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.channel.nack(tag, requeue).await
    }
}

/// Low-level callback: receives every delivery and decides how to settle it.
///
/// With `auto_ack` consumption the broker has already settled the delivery and
/// the handler must not ack or nack it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, channel: &mut AckChannel<'_>, delivery: Delivery);
}

/// What an application handler wants done with the message it processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    /// Explicit failure: return the message to the queue for redelivery.
    Requeue,
}

/// Application-level handler used with automatic acknowledgement.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        payload: Payload,
        properties: MessageProperties,
    ) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Payload, MessageProperties) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    async fn handle(
        &self,
        payload: Payload,
        properties: MessageProperties,
    ) -> anyhow::Result<HandlerOutcome> {
        (self)(payload, properties).await
    }
}

/// Acks after a successful handler run; nacks with requeue on
/// [`HandlerOutcome::Requeue`], on error and on panic.
pub struct AutoAck<H> {
    queue: String,
    inner: H,
}

impl<H: MessageHandler> AutoAck<H> {
    pub fn new(queue: impl Into<String>, inner: H) -> Self {
        Self {
            queue: queue.into(),
            inner,
        }
    }
}

#[async_trait]
impl<H: MessageHandler> DeliveryHandler for AutoAck<H> {
    async fn handle(&self, channel: &mut AckChannel<'_>, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let payload = delivery.payload();

        let result = AssertUnwindSafe(self.inner.handle(payload, delivery.properties))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(HandlerOutcome::Ack)) => None,
            Ok(Ok(HandlerOutcome::Requeue)) => Some("handler requested redelivery".to_string()),
            Ok(Err(e)) => Some(format!("handler failed: {:#}", e)),
            Err(_) => Some("handler panicked".to_string()),
        };

        match failure {
            None => {
                if let Err(e) = channel.ack(tag).await {
                    error!(queue = %self.queue, tag = %tag, error = %e, "Failed to acknowledge message");
                } else {
                    debug!(queue = %self.queue, tag = %tag, "Message acknowledged");
                }
            }
            Some(reason) => {
                warn!(queue = %self.queue, tag = %tag, "{}; requeueing", reason);
                if let Err(e) = channel.nack(tag, true).await {
                    error!(queue = %self.queue, tag = %tag, error = %e, "Failed to negatively acknowledge message");
                }
            }
        }
    }
}
