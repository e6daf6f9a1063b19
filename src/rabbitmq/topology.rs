// src/rabbitmq/topology.rs
//! Exchange, queue and binding definitions plus the channel operations that
//! declare, inspect and remove them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};

use super::channel_manager::ChannelHandle;
use super::errors::{MessagingError, Result, REPLY_NOT_FOUND};
use crate::message::FieldArguments;

pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// The default (nameless) exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

const DEFAULT_DOMAINS: [&str; 5] = ["business", "marketing", "training", "finance", "notification"];
const TASK_QUEUE_TTL_MS: i64 = 1000 * 60 * 60 * 24;
const TASK_QUEUE_MAX_LENGTH: i64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = MessagingError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            "fanout" => Ok(ExchangeType::Fanout),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(MessagingError::Unknown(format!("unsupported exchange type '{}'", other))),
        }
    }
}

fn yes() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ExchangeType,
    #[serde(default = "yes")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: FieldArguments,
}

impl ExchangeSpec {
    /// A durable exchange of the given type.
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldArguments::new(),
        }
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Empty asks the broker to generate a name.
    #[serde(default)]
    pub name: String,
    #[serde(default = "yes")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: FieldArguments,
}

impl QueueSpec {
    /// A durable, shared, non-auto-delete queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: FieldArguments::new(),
        }
    }

    /// A broker-named, exclusive, auto-delete queue.
    pub fn server_named() -> Self {
        Self::new("").transient().exclusive().auto_delete()
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn dead_letter_exchange(self, exchange: impl Into<String>) -> Self {
        self.argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, exchange.into())
    }

    pub fn dead_letter_routing_key(self, routing_key: impl Into<String>) -> Self {
        self.argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, routing_key.into())
    }

    pub fn message_ttl_ms(self, ttl: i64) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, ttl)
    }

    pub fn max_length(self, max: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, max)
    }

    pub fn max_length_bytes(self, max: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, max)
    }

    pub fn argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn dead_letter_target(&self) -> Option<&str> {
        self.arguments
            .get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
            .and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub arguments: FieldArguments,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: FieldArguments::new(),
        }
    }

    pub fn argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Result of a queue declaration or passive inspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Topology declared at startup, in order: exchanges, queues, bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::application_defaults("bizmq", &DEFAULT_DOMAINS)
    }
}

impl TopologyConfig {
    pub fn empty() -> Self {
        Self {
            exchanges: Vec::new(),
            queues: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Event exchange, dead-letter exchange, one task queue per domain and a
    /// dead-letter queue, all named under `prefix`.
    pub fn application_defaults(prefix: &str, domains: &[&str]) -> Self {
        let events = format!("{}.events", prefix);
        let dlx = format!("{}.dlx", prefix);
        let dead_letters = format!("{}.dead_letters", prefix);

        let mut config = Self::empty();
        config.exchanges.push(ExchangeSpec::new(&events, ExchangeType::Topic));
        config.exchanges.push(ExchangeSpec::new(&dlx, ExchangeType::Fanout));

        for domain in domains {
            let queue = format!("{}.{}.tasks", prefix, domain);
            config.queues.push(
                QueueSpec::new(&queue)
                    .dead_letter_exchange(&dlx)
                    .message_ttl_ms(TASK_QUEUE_TTL_MS)
                    .max_length(TASK_QUEUE_MAX_LENGTH),
            );
            config
                .bindings
                .push(BindingSpec::new(&queue, &events, format!("{}.#", domain)));
        }

        config.queues.push(QueueSpec::new(&dead_letters));
        config.bindings.push(BindingSpec::new(&dead_letters, &dlx, ""));
        config
    }
}

impl ChannelHandle {
    pub async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        match self.raw().declare_exchange(spec).await {
            Ok(()) => {
                info!(exchange = %spec.name, kind = %spec.kind, "Exchange declared");
                Ok(())
            }
            Err(e) => {
                error!(exchange = %spec.name, error = %e, "Failed to declare exchange");
                Err(e)
            }
        }
    }

    pub async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<String> {
        match self.raw().declare_queue(spec).await {
            Ok(info) => {
                info!(queue = %info.name, messages = info.message_count, "Queue declared");
                Ok(info.name)
            }
            Err(e) => {
                error!(queue = %spec.name, error = %e, "Failed to declare queue");
                Err(e)
            }
        }
    }

    /// Passive lookup. A missing queue is `Ok(None)`; the broker closes the
    /// channel in that case, so callers should reopen it.
    pub async fn queue_info(&mut self, name: &str) -> Result<Option<QueueInfo>> {
        match self.raw().inspect_queue(name).await {
            Ok(info) => Ok(Some(info)),
            Err(MessagingError::ChannelClosed { code, .. }) if code == REPLY_NOT_FOUND => {
                warn!(queue = %name, "Queue does not exist");
                Ok(None)
            }
            Err(e) => {
                error!(queue = %name, error = %e, "Failed to inspect queue");
                Err(e)
            }
        }
    }

    pub async fn bind_queue(&mut self, binding: &BindingSpec) -> Result<()> {
        match self.raw().bind_queue(binding).await {
            Ok(()) => {
                info!(
                    queue = %binding.queue,
                    exchange = %binding.exchange,
                    routing_key = %binding.routing_key,
                    "Queue bound"
                );
                Ok(())
            }
            Err(e) => {
                error!(queue = %binding.queue, exchange = %binding.exchange, error = %e, "Failed to bind queue");
                Err(e)
            }
        }
    }

    pub async fn unbind_queue(&mut self, binding: &BindingSpec) -> Result<()> {
        match self.raw().unbind_queue(binding).await {
            Ok(()) => {
                info!(queue = %binding.queue, exchange = %binding.exchange, "Queue unbound");
                Ok(())
            }
            Err(e) => {
                error!(queue = %binding.queue, exchange = %binding.exchange, error = %e, "Failed to unbind queue");
                Err(e)
            }
        }
    }

    pub async fn purge_queue(&mut self, name: &str) -> Result<u32> {
        let purged = self.raw().purge_queue(name).await.map_err(|e| {
            error!(queue = %name, error = %e, "Failed to purge queue");
            e
        })?;
        info!(queue = %name, purged, "Queue purged");
        Ok(purged)
    }

    pub async fn delete_queue(&mut self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let undelivered = self
            .raw()
            .delete_queue(name, if_unused, if_empty)
            .await
            .map_err(|e| {
                error!(queue = %name, error = %e, "Failed to delete queue");
                e
            })?;
        info!(queue = %name, undelivered, "Queue deleted");
        Ok(undelivered)
    }

    pub async fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<()> {
        self.raw().delete_exchange(name, if_unused).await.map_err(|e| {
            error!(exchange = %name, error = %e, "Failed to delete exchange");
            e
        })?;
        info!(exchange = %name, "Exchange deleted");
        Ok(())
    }

    /// Declares everything in `topology`, stopping at the first failure.
    pub async fn install(&mut self, topology: &TopologyConfig) -> Result<()> {
        for exchange in &topology.exchanges {
            self.declare_exchange(exchange).await?;
        }
        for queue in &topology.queues {
            self.declare_queue(queue).await?;
        }
        for binding in &topology.bindings {
            self.bind_queue(binding).await?;
        }
        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "Messaging topology installed"
        );
        Ok(())
    }
}
