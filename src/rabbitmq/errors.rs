// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::message::DeliveryTag;

/// AMQP reply code for a missing entity (passive declare of an absent queue).
pub const REPLY_NOT_FOUND: u16 = 404;
/// AMQP reply code for conflicting declarations, unknown delivery tags and similar.
pub const REPLY_PRECONDITION_FAILED: u16 = 406;
/// AMQP reply code for exclusive queues used from another connection.
pub const REPLY_RESOURCE_LOCKED: u16 = 405;
/// AMQP reply code for refused consumer access (exclusive consume conflicts).
pub const REPLY_ACCESS_REFUSED: u16 = 403;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ connection is not established")]
    NotConnected,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// The broker closed the channel in response to a protocol exception.
    #[error("channel closed by broker ({code}): {reason}")]
    ChannelClosed { code: u16, reason: String },

    #[error("message to exchange '{exchange}' with routing key '{routing_key}' was unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("broker rejected published message")]
    PublishNacked,

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("delivery tag {tag} does not belong to the current channel")]
    StaleDeliveryTag { tag: DeliveryTag },

    #[error("a consumer is already active on queue '{0}'")]
    ConsumerAlreadyActive(String),

    #[error("no consumer registered for queue '{0}'")]
    ConsumerNotFound(String),

    #[error("consumer for queue '{0}' is not running")]
    ConsumerNotRunning(String),

    #[error("consumer for queue '{0}' is already being stopped")]
    ConsumerStopping(String),

    #[error("consumer for queue '{queue}' did not stop within {timeout:?}")]
    ConsumerStopTimeout { queue: String, timeout: Duration },

    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    #[error("Lock acquisition failed")]
    LockError,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    pub fn channel_closed(code: u16, reason: impl Into<String>) -> Self {
        MessagingError::ChannelClosed {
            code,
            reason: reason.into(),
        }
    }

    /// True when the error means the channel it happened on is no longer usable.
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            MessagingError::ChannelClosed { .. } | MessagingError::ChannelError(_)
        )
    }

    /// True for connection-level failures that require a fresh connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionError(_) | MessagingError::NotConnected
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for MessagingError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match error {
            LapinError::ProtocolError(ref amqp_error) => MessagingError::ChannelClosed {
                code: amqp_error.get_id(),
                reason: error_text,
            },
            LapinError::InvalidChannelState(_) => MessagingError::ChannelError(error_text),
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                MessagingError::ConnectionError(error_text)
            }
            _ => MessagingError::Unknown(error_text),
        }
    }
}

impl From<Elapsed> for MessagingError {
    fn from(_: Elapsed) -> Self {
        MessagingError::TimeoutError("broker did not answer in time".to_string())
    }
}

impl From<String> for MessagingError {
    fn from(message: String) -> Self {
        MessagingError::Unknown(message)
    }
}

impl From<&str> for MessagingError {
    fn from(message: &str) -> Self {
        MessagingError::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_closed_errors_close_the_channel() {
        let err = MessagingError::channel_closed(REPLY_NOT_FOUND, "NOT_FOUND - no queue 'x'");
        assert!(err.closes_channel());
        assert!(!err.is_connection_error());
        assert_eq!(err.to_string(), "channel closed by broker (404): NOT_FOUND - no queue 'x'");
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(MessagingError::NotConnected.is_connection_error());
        assert!(MessagingError::ConnectionError("refused".into()).is_connection_error());
        assert!(!MessagingError::PublishNacked.closes_channel());
    }

    #[test]
    fn plain_strings_become_unknown_errors() {
        let err: MessagingError = "boom".into();
        assert!(matches!(err, MessagingError::Unknown(ref m) if m == "boom"));
    }
}
