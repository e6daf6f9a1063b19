use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::broker::{Broker, BrokerConnection};
use super::channel_manager::{ChannelConfig, ChannelHandle};
use super::errors::{MessagingError, Result};
use crate::config::{ConnectionConfig, ReconnectPolicy};

/// Owns one broker connection and its primary channel.
///
/// Nothing reconnects in the background: callers go through
/// [`ensure_connection`](Self::ensure_connection) / [`ensure_channel`](Self::ensure_channel)
/// before each operation.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    channel_config: ChannelConfig,
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<ChannelHandle>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig) -> Self {
        ConnectionManager {
            broker,
            config,
            policy: ReconnectPolicy::default(),
            channel_config: ChannelConfig::labelled("primary"),
            connection: None,
            channel: None,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_channel_config(mut self, channel_config: ChannelConfig) -> Self {
        self.channel_config = channel_config;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().map_or(false, |conn| conn.is_open())
    }

    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().map_or(false, |ch| ch.is_open())
    }

    /// Opens a fresh connection, retrying with exponential backoff and jitter.
    ///
    /// Any previous connection and channel are discarded first.
    pub async fn connect(&mut self) -> Result<()> {
        let policy = self.policy.clone();
        self.connect_with(&policy).await
    }

    /// Makes exactly one connection attempt, without backoff.
    pub async fn connect_once(&mut self) -> Result<()> {
        self.connect_with(&ReconnectPolicy::fail_fast()).await
    }

    async fn connect_with(&mut self, policy: &ReconnectPolicy) -> Result<()> {
        self.channel = None;
        self.connection = None;

        let endpoint = self.config.endpoint();
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!("Attempting to connect to RabbitMQ at {}", endpoint);

            match self.broker.connect(&self.config).await {
                Ok(conn) => {
                    info!("Connected to RabbitMQ at {}", endpoint);
                    self.connection = Some(conn);
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempt, policy.max_attempts, err
                    );

                    if attempt >= policy.max_attempts {
                        return Err(match err {
                            MessagingError::ConnectionError(_) => err,
                            other => MessagingError::ConnectionError(other.to_string()),
                        });
                    }

                    let delay = policy.delay_for(attempt);
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay.as_millis() as f64;
                    let sleep_ms = (delay.as_millis() as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next reconnect attempt", sleep_ms);
                    sleep(std::time::Duration::from_millis(sleep_ms)).await;
                }
            }
        }
    }

    pub async fn ensure_connection(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    /// Returns the primary channel, opening a new one if needed.
    pub async fn ensure_channel(&mut self) -> Result<&mut ChannelHandle> {
        self.ensure_connection().await?;

        if !self.channel_open() {
            let connection = self.connection.as_deref().ok_or(MessagingError::NotConnected)?;
            let channel = match ChannelHandle::open(connection, self.channel_config.clone()).await {
                Ok(channel) => channel,
                Err(e) => {
                    error!("Failed to create channel: {}", e);
                    return Err(e);
                }
            };
            self.channel = Some(channel);
        }

        self.channel.as_mut().ok_or_else(|| {
            MessagingError::ChannelError("Channel is not available".to_string())
        })
    }

    /// Opens an extra channel on the current connection, for consumers that
    /// must not hold the primary channel.
    pub async fn open_dedicated_channel(&mut self, config: ChannelConfig) -> Result<ChannelHandle> {
        self.ensure_connection().await?;
        let connection = self.connection.as_deref().ok_or(MessagingError::NotConnected)?;
        ChannelHandle::open(connection, config).await
    }

    /// Reopens the primary channel when the last operation left it closed.
    /// The operation's own result is left for the caller to report.
    pub async fn recover_channel<T>(&mut self, result: &Result<T>) {
        match result {
            Err(err) if err.is_connection_error() => return,
            Err(err) if err.closes_channel() => {
                warn!("Channel closed after error ({}); reopening", err);
            }
            _ if self.channel.is_some() && !self.channel_open() => {
                warn!("Channel closed by broker; reopening");
            }
            _ => return,
        }

        self.channel = None;
        if let Err(e) = self.ensure_channel().await {
            error!("Failed to reopen channel: {}", e);
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!("Ignoring channel close failure: {}", e);
            }
        }
        if let Some(conn) = self.connection.take() {
            if conn.is_open() {
                info!("Closing RabbitMQ connection gracefully");
                conn.close().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::InMemoryBroker;

    fn manager(broker: &InMemoryBroker, max_attempts: u32) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), ConnectionConfig::default())
            .with_reconnect_policy(ReconnectPolicy {
                max_attempts,
                initial_delay_ms: 1,
                max_delay_ms: 1,
            })
    }

    #[tokio::test]
    async fn connect_retries_up_to_the_policy_limit() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut manager = manager(&broker, 3);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, MessagingError::ConnectionError(_)));
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn connect_once_ignores_the_retry_policy() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut manager = manager(&broker, 3);

        assert!(manager.connect_once().await.is_err());
        assert_eq!(broker.connect_attempts(), 1);

        broker.set_available(true);
        manager.connect_once().await.unwrap();
        assert!(manager.is_connected());
        assert!(!manager.channel_open());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
