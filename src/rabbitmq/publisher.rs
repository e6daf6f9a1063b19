use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::broker::PublishOutcome;
use super::channel_manager::ChannelHandle;
use super::errors::{MessagingError, Result};
use super::topology::DEFAULT_EXCHANGE;
use crate::message::{MessageProperties, Payload, DELIVERY_MODE_PERSISTENT};

/// Encodes payloads, fills in default properties and publishes on a channel.
#[derive(Debug, Clone)]
pub struct Publisher {
    app_id: String,
    publish_timeout: Duration,
}

impl Publisher {
    pub fn new(app_id: impl Into<String>, publish_timeout: Duration) -> Self {
        Self {
            app_id: app_id.into(),
            publish_timeout,
        }
    }

    /// Persistent delivery, creation timestamp, content type matching the
    /// payload, producer app id, fresh message id and a `created_at` header.
    pub fn default_properties(&self, payload: &Payload) -> MessageProperties {
        let now = Utc::now();
        MessageProperties {
            content_type: Some(payload.content_type().to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            timestamp: Some(now.timestamp().max(0) as u64),
            message_id: Some(Uuid::new_v4().to_string()),
            app_id: Some(self.app_id.clone()),
            ..MessageProperties::default()
        }
        .with_header("created_at", now.to_rfc3339())
    }

    pub async fn publish(
        &self,
        channel: &mut ChannelHandle,
        exchange: &str,
        routing_key: &str,
        payload: &Payload,
        properties: Option<MessageProperties>,
        mandatory: bool,
    ) -> Result<()> {
        let body = payload.encode().map_err(|e| {
            error!(exchange = %exchange, routing_key = %routing_key, error = %e, "Failed to encode message");
            MessagingError::SerializationError(e)
        })?;
        let properties = properties.unwrap_or_else(|| self.default_properties(payload));

        let sent = tokio::time::timeout(
            self.publish_timeout,
            channel
                .raw()
                .publish(exchange, routing_key, &body, &properties, mandatory),
        )
        .await;

        let outcome = match sent {
            Ok(outcome) => outcome,
            Err(elapsed) => {
                error!(exchange = %exchange, routing_key = %routing_key, "Publish stalled; connection may be blocked");
                return Err(elapsed.into());
            }
        };

        match outcome {
            Ok(PublishOutcome::Confirmed) | Ok(PublishOutcome::Sent) => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    bytes = body.len(),
                    "Message published"
                );
                Ok(())
            }
            Ok(PublishOutcome::Returned) => {
                warn!(exchange = %exchange, routing_key = %routing_key, "Mandatory message was unroutable");
                Err(MessagingError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
            Ok(PublishOutcome::Nacked) => {
                error!(exchange = %exchange, routing_key = %routing_key, "Broker nacked published message");
                Err(MessagingError::PublishNacked)
            }
            Err(e) => {
                error!(exchange = %exchange, routing_key = %routing_key, error = %e, "Failed to publish message");
                Err(e)
            }
        }
    }

    /// Publishes through the default exchange straight into `queue`.
    pub async fn publish_to_queue(
        &self,
        channel: &mut ChannelHandle,
        queue: &str,
        payload: &Payload,
        properties: Option<MessageProperties>,
    ) -> Result<()> {
        self.publish(channel, DEFAULT_EXCHANGE, queue, payload, properties, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_properties_mark_messages_persistent() {
        let publisher = Publisher::new("billing-svc", Duration::from_secs(1));
        let props = publisher.default_properties(&Payload::Json(json!({"a": 1})));

        assert!(props.is_persistent());
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.app_id.as_deref(), Some("billing-svc"));
        assert!(props.timestamp.is_some());
        assert!(props.message_id.is_some());
        assert!(props.created_at().is_some());
    }

    #[test]
    fn text_payloads_are_labelled_as_text() {
        let publisher = Publisher::new("svc", Duration::from_secs(1));
        let props = publisher.default_properties(&Payload::from("hello"));
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
    }
}
