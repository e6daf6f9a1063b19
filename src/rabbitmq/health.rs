// src/rabbitmq/health.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub host: String,
    pub port: u16,
    #[serde(rename = "virtual_host")]
    pub vhost: String,
    pub is_connected: bool,
}

/// Snapshot of the messaging client, suitable for a health endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub connection: ConnectionSummary,
    pub channel_open: bool,
    pub active_consumers: usize,
    pub consumer_queues: Vec<String>,
    pub reconnect_attempted: bool,
    /// Only set when a reconnect was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_succeeded: Option<bool>,
}

impl HealthReport {
    pub(crate) fn new(
        config: &ConnectionConfig,
        connected: bool,
        channel_open: bool,
        consumer_queues: Vec<String>,
    ) -> Self {
        Self {
            status: if connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            timestamp: Utc::now(),
            connection: ConnectionSummary {
                host: config.host.clone(),
                port: config.port,
                vhost: config.vhost.clone(),
                is_connected: connected,
            },
            channel_open,
            active_consumers: consumer_queues.len(),
            consumer_queues,
            reconnect_attempted: false,
            reconnect_succeeded: None,
        }
    }

    pub(crate) fn with_reconnect(mut self, succeeded: bool) -> Self {
        self.reconnect_attempted = true;
        self.reconnect_succeeded = Some(succeeded);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
