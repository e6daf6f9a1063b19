#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use bizmq::rabbitmq::AckChannel;
use bizmq::{
    Delivery, DeliveryHandler, InMemoryBroker, MessagingConfig, RabbitMQClient, ReconnectPolicy,
};

/// Config for tests: one connect attempt, short join timeout.
pub fn test_config() -> MessagingConfig {
    let mut config = MessagingConfig::default();
    config.reconnect = ReconnectPolicy::fail_fast();
    config.consumer.join_timeout_ms = 1_000;
    config
}

pub fn client_with(config: MessagingConfig) -> (Arc<InMemoryBroker>, RabbitMQClient) {
    let broker = Arc::new(InMemoryBroker::new());
    let client = RabbitMQClient::new(broker.clone(), config);
    (broker, client)
}

pub fn client() -> (Arc<InMemoryBroker>, RabbitMQClient) {
    client_with(test_config())
}

/// Acks every delivery on the channel that issued it, then forwards it to the test.
pub struct Forwarding {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Forwarding {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeliveryHandler for Forwarding {
    async fn handle(&self, channel: &mut AckChannel<'_>, delivery: Delivery) {
        assert_eq!(channel.channel_id(), delivery.delivery_tag.channel);
        channel
            .ack(delivery.delivery_tag)
            .await
            .expect("ack on the delivering channel");
        let _ = self.sender.send(delivery);
    }
}

pub async fn recv<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("sender dropped")
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
