use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{BrokerChannel, BrokerConnection};
use super::errors::Result;
use crate::message::{ChannelId, DeliveryTag};

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel label for logging (defaults to a short UUID)
    pub label: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            confirm_mode: true,
            label: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

/// An open channel owned by exactly one task.
///
/// Not `Clone` and not `Sync`: the handle can be moved into a worker but
/// never used from two tasks at once. Delivery tags it hands out carry its
/// [`ChannelId`] so they cannot be acknowledged elsewhere.
pub struct ChannelHandle {
    id: ChannelId,
    inner: Box<dyn BrokerChannel>,
    config: ChannelConfig,
}

impl ChannelHandle {
    /// Opens a channel on `connection` and applies QoS and confirm mode.
    pub async fn open(connection: &dyn BrokerConnection, config: ChannelConfig) -> Result<Self> {
        let mut inner = connection.open_channel().await?;

        if config.prefetch_count > 0 {
            debug!(channel = %config.label, prefetch = config.prefetch_count, "Setting channel QoS");
            inner.set_prefetch(config.prefetch_count).await?;
        }

        if config.confirm_mode {
            debug!(channel = %config.label, "Enabling confirm mode");
            inner.enable_confirms().await?;
        }

        let id = ChannelId::next();
        info!(channel = %config.label, id = %id, "Channel created and configured");
        Ok(Self { id, inner, config })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether `tag` was issued by this channel.
    pub fn owns(&self, tag: &DeliveryTag) -> bool {
        tag.channel == self.id
    }

    pub(crate) fn raw(&mut self) -> &mut dyn BrokerChannel {
        self.inner.as_mut()
    }

    pub async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()> {
        self.inner.set_prefetch(prefetch_count).await?;
        self.config.prefetch_count = prefetch_count;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if !self.inner.is_open() {
            return Ok(());
        }
        debug!(channel = %self.label(), "Closing channel");
        if let Err(e) = self.inner.close().await {
            warn!(channel = %self.label(), error = %e, "Channel did not close cleanly");
            return Err(e);
        }
        Ok(())
    }
}
