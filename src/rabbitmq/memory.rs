// src/rabbitmq/memory.rs
//! In-process broker following AMQP 0-9-1 semantics closely enough to run the
//! messaging layer without a RabbitMQ server.
//!
//! Covered: direct, topic, fanout and headers exchanges, the default exchange,
//! publisher confirms, mandatory returns, per-channel prefetch, ack/nack with
//! requeue, dead-lettering on reject and on length overflow, exclusive and
//! auto-delete queues, and channel-closing protocol errors with AMQP reply
//! codes. Message TTLs are stored with the queue but never expire anything.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, PublishOutcome, RawDelivery,
    RawDeliveryStream,
};
use super::errors::{
    MessagingError, Result, REPLY_ACCESS_REFUSED, REPLY_NOT_FOUND, REPLY_PRECONDITION_FAILED,
    REPLY_RESOURCE_LOCKED,
};
use super::topology::{
    BindingSpec, ExchangeSpec, ExchangeType, QueueInfo, QueueSpec,
    AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES,
};
use crate::config::ConnectionConfig;
use crate::message::{FieldArguments, MessageProperties};

const X_MATCH: &str = "x-match";

fn not_found(kind: &str, name: &str) -> MessagingError {
    MessagingError::channel_closed(
        REPLY_NOT_FOUND,
        format!("NOT_FOUND - no {} '{}' in vhost", kind, name),
    )
}

fn precondition_failed(reason: impl AsRef<str>) -> MessagingError {
    MessagingError::channel_closed(
        REPLY_PRECONDITION_FAILED,
        format!("PRECONDITION_FAILED - {}", reason.as_ref()),
    )
}

fn resource_locked(queue: &str) -> MessagingError {
    MessagingError::channel_closed(
        REPLY_RESOURCE_LOCKED,
        format!(
            "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
            queue
        ),
    )
}

fn access_refused(reason: impl AsRef<str>) -> MessagingError {
    MessagingError::channel_closed(
        REPLY_ACCESS_REFUSED,
        format!("ACCESS_REFUSED - {}", reason.as_ref()),
    )
}

/// Matches an AMQP topic pattern (`*` = one word, `#` = zero or more words).
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

/// One pass per pattern word; `reachable[i]` holds when the words seen so far
/// can match exactly `key[..i]`.
fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;
    for word in pattern {
        if *word == "#" {
            let mut seen = false;
            for slot in reachable.iter_mut() {
                seen |= *slot;
                *slot = seen;
            }
        } else {
            for i in (1..=key.len()).rev() {
                reachable[i] = reachable[i - 1] && (*word == "*" || key[i - 1] == *word);
            }
            reachable[0] = false;
        }
    }
    reachable[key.len()]
}

/// Headers exchange matching: `x-match = all` (default) or `any` over the
/// binding arguments that do not start with `x-`.
pub(crate) fn headers_match(arguments: &FieldArguments, headers: &FieldArguments) -> bool {
    let match_any = arguments.get(X_MATCH).and_then(Value::as_str) == Some("any");
    let wanted: Vec<(&String, &Value)> = arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .collect();

    if wanted.is_empty() {
        return !match_any;
    }
    if match_any {
        wanted.iter().any(|(k, v)| headers.get(*k) == Some(*v))
    } else {
        wanted.iter().all(|(k, v)| headers.get(*k) == Some(*v))
    }
}

#[derive(Clone, Debug)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

impl StoredMessage {
    fn delivery(&self, delivery_tag: u64) -> RawDelivery {
        RawDelivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct Exchange {
    spec: ExchangeSpec,
    bindings: Vec<BindingSpec>,
}

struct Consumer {
    tag: String,
    channel: u64,
    auto_ack: bool,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<RawDelivery>>,
}

struct Queue {
    spec: QueueSpec,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl Queue {
    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.spec.name.clone(),
            message_count: self.messages.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn limit(&self, key: &str) -> Option<usize> {
        self.spec
            .arguments
            .get(key)
            .and_then(Value::as_u64)
            .map(|limit| limit as usize)
    }

    fn over_limit(&self) -> bool {
        if let Some(max) = self.limit(AMQP_HEADERS_MAX_LENGTH) {
            if self.messages.len() > max {
                return true;
            }
        }
        if let Some(max) = self.limit(AMQP_HEADERS_MAX_LENGTH_BYTES) {
            let bytes: usize = self.messages.iter().map(|m| m.body.len()).sum();
            if bytes > max {
                return true;
            }
        }
        false
    }

    fn locked_for(&self, connection: u64) -> bool {
        self.owner.map_or(false, |owner| owner != connection)
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    confirms: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelState {
    fn new(connection: u64) -> Self {
        Self {
            connection,
            prefetch: 0,
            confirms: false,
            next_tag: 0,
            unacked: BTreeMap::new(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }

    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_open(&self, connection: u64, channel: u64) -> Result<()> {
        if !self.connections.contains(&connection) {
            return Err(MessagingError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        if !self.channels.contains_key(&channel) {
            return Err(MessagingError::ChannelError(format!(
                "channel {} is closed",
                channel
            )));
        }
        Ok(())
    }

    /// Closes the channel when `result` carries a channel-level protocol error.
    fn settle<T>(&mut self, channel: u64, result: Result<T>) -> Result<T> {
        if let Err(MessagingError::ChannelClosed { code, reason }) = &result {
            warn!(channel, code, "In-memory broker closed channel: {}", reason);
            self.close_channel(channel);
        }
        result
    }

    fn queue_mut(&mut self, connection: u64, name: &str) -> Result<&mut Queue> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| not_found("queue", name))?;
        if queue.locked_for(connection) {
            return Err(resource_locked(name));
        }
        Ok(queue)
    }

    fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        if spec.name.is_empty() || spec.name.starts_with("amq.") {
            return Err(access_refused(format!(
                "exchange name '{}' is reserved",
                spec.name
            )));
        }
        match self.exchanges.get(&spec.name) {
            Some(existing) => {
                let equivalent = existing.spec.kind == spec.kind
                    && existing.spec.durable == spec.durable
                    && existing.spec.auto_delete == spec.auto_delete
                    && existing.spec.internal == spec.internal;
                if !equivalent {
                    return Err(precondition_failed(format!(
                        "inequivalent arg for exchange '{}'",
                        spec.name
                    )));
                }
            }
            None => {
                self.exchanges.insert(
                    spec.name.clone(),
                    Exchange {
                        spec: spec.clone(),
                        bindings: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<()> {
        let Some(exchange) = self.exchanges.get(name) else {
            return Ok(());
        };
        if if_unused && !exchange.bindings.is_empty() {
            return Err(precondition_failed(format!("exchange '{}' in use", name)));
        }
        self.exchanges.remove(name);
        Ok(())
    }

    fn declare_queue(&mut self, connection: u64, spec: &QueueSpec) -> Result<QueueInfo> {
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.locked_for(connection) {
                return Err(resource_locked(&name));
            }
            let equivalent = existing.spec.durable == spec.durable
                && existing.spec.exclusive == spec.exclusive
                && existing.spec.auto_delete == spec.auto_delete
                && existing.spec.arguments == spec.arguments;
            if !equivalent {
                return Err(precondition_failed(format!(
                    "inequivalent arg for queue '{}'",
                    name
                )));
            }
            return Ok(existing.info());
        }

        let mut stored = spec.clone();
        stored.name = name.clone();
        self.queues.insert(
            name.clone(),
            Queue {
                spec: stored,
                owner: spec.exclusive.then_some(connection),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(QueueInfo {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    fn bind_queue(&mut self, connection: u64, binding: &BindingSpec) -> Result<()> {
        if binding.exchange.is_empty() {
            return Err(access_refused("operation not permitted on the default exchange"));
        }
        self.queue_mut(connection, &binding.queue)?;
        let exchange = self
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| not_found("exchange", &binding.exchange))?;
        if !exchange.bindings.contains(binding) {
            exchange.bindings.push(binding.clone());
        }
        Ok(())
    }

    fn unbind_queue(&mut self, connection: u64, binding: &BindingSpec) -> Result<()> {
        if binding.exchange.is_empty() {
            return Err(access_refused("operation not permitted on the default exchange"));
        }
        self.queue_mut(connection, &binding.queue)?;
        let exchange = self
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| not_found("exchange", &binding.exchange))?;
        exchange.bindings.retain(|existing| existing != binding);
        Ok(())
    }

    fn purge_queue(&mut self, connection: u64, name: &str) -> Result<u32> {
        let queue = self.queue_mut(connection, name)?;
        let purged = queue.messages.len() as u32;
        queue.messages.clear();
        Ok(purged)
    }

    fn delete_queue(
        &mut self,
        connection: u64,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32> {
        let Some(queue) = self.queues.get(name) else {
            return Ok(0);
        };
        if queue.locked_for(connection) {
            return Err(resource_locked(name));
        }
        if if_unused && !queue.consumers.is_empty() {
            return Err(precondition_failed(format!("queue '{}' in use", name)));
        }
        if if_empty && !queue.messages.is_empty() {
            return Err(precondition_failed(format!("queue '{}' not empty", name)));
        }
        Ok(self.remove_queue(name))
    }

    /// Drops the queue, its bindings and its consumers (their streams end).
    fn remove_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
        debug!(queue = %name, "In-memory queue removed");
        queue.messages.len() as u32
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: &FieldArguments,
    ) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let source = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &source.bindings {
            let matched = match source.spec.kind {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Fanout => true,
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeType::Headers => headers_match(&binding.arguments, headers),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn publish(
        &mut self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome> {
        let targets = self.route(exchange, routing_key, &properties.headers)?;
        let confirms = self.channels.get(&channel).map_or(false, |ch| ch.confirms);

        if targets.is_empty() {
            if mandatory {
                return Ok(PublishOutcome::Returned);
            }
            debug!(exchange = %exchange, routing_key = %routing_key, "No queue bound; message dropped");
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            properties: properties.clone(),
            body: body.to_vec(),
        };
        for target in targets {
            self.enqueue(&target, message.clone());
        }

        Ok(if confirms {
            PublishOutcome::Confirmed
        } else {
            PublishOutcome::Sent
        })
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) {
        let mut overflow = Vec::new();
        {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.messages.push_back(message);
            while queue.over_limit() {
                match queue.messages.pop_front() {
                    Some(dropped) => overflow.push(dropped),
                    None => break,
                }
            }
        }
        for dropped in overflow {
            self.dead_letter(queue_name, dropped, "maxlen");
        }
        self.dispatch(queue_name);
    }

    /// Republishes a rejected or overflowed message to the queue's
    /// dead-letter exchange, or drops it when none is configured.
    fn dead_letter(&mut self, queue_name: &str, mut message: StoredMessage, reason: &str) {
        let Some(queue) = self.queues.get(queue_name) else {
            return;
        };
        let Some(dlx) = queue.spec.dead_letter_target().map(str::to_string) else {
            debug!(queue = %queue_name, reason, "Message discarded without dead-letter exchange");
            return;
        };
        let routing_key = queue
            .spec
            .arguments
            .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| message.routing_key.clone());

        let headers = &mut message.properties.headers;
        headers
            .entry("x-first-death-queue".to_string())
            .or_insert_with(|| json!(queue_name));
        headers
            .entry("x-first-death-reason".to_string())
            .or_insert_with(|| json!(reason));
        headers
            .entry("x-first-death-exchange".to_string())
            .or_insert_with(|| json!(message.exchange));

        message.exchange = dlx.clone();
        message.routing_key = routing_key.clone();
        message.redelivered = false;

        let targets = match self.route(&dlx, &routing_key, &message.properties.headers) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(queue = %queue_name, exchange = %dlx, error = %e, "Dead-letter exchange unavailable");
                return;
            }
        };
        for target in targets.into_iter().filter(|t| t != queue_name) {
            self.enqueue(&target, message.clone());
        }
    }

    /// Pushes ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut picked = None;
            for offset in 0..count {
                let idx = (queue.next_consumer + offset) % count;
                let consumer = &queue.consumers[idx];
                let ready = self
                    .channels
                    .get(&consumer.channel)
                    .map_or(false, |ch| consumer.auto_ack || ch.has_capacity());
                if ready {
                    picked = Some(idx);
                    break;
                }
            }
            let Some(idx) = picked else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let (channel_id, auto_ack) = {
                let consumer = &queue.consumers[idx];
                (consumer.channel, consumer.auto_ack)
            };
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                queue.messages.push_front(message);
                return;
            };

            let tag = channel.next_tag();
            let delivery = message.delivery(tag);
            if !auto_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message: message.clone(),
                    },
                );
            }

            if queue.consumers[idx].sender.send(Ok(delivery)).is_err() {
                channel.unacked.remove(&tag);
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
            }
        }
    }

    fn dispatch_all(&mut self) {
        let busy: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.consumers.is_empty() && !q.messages.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in busy {
            self.dispatch(&name);
        }
    }

    fn get(
        &mut self,
        connection: u64,
        channel: u64,
        queue: &str,
        auto_ack: bool,
    ) -> Result<Option<RawDelivery>> {
        let Some(message) = self.queue_mut(connection, queue)?.messages.pop_front() else {
            return Ok(None);
        };
        let Some(channel_state) = self.channels.get_mut(&channel) else {
            return Err(MessagingError::ChannelError(format!(
                "channel {} is closed",
                channel
            )));
        };

        let tag = channel_state.next_tag();
        let delivery = message.delivery(tag);
        if !auto_ack {
            channel_state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }
        Ok(Some(delivery))
    }

    fn take_unacked(&mut self, channel: u64, tag: u64) -> Result<Unacked> {
        self.channels
            .get_mut(&channel)
            .and_then(|ch| ch.unacked.remove(&tag))
            .ok_or_else(|| precondition_failed(format!("unknown delivery tag {}", tag)))
    }

    fn ack(&mut self, channel: u64, tag: u64) -> Result<()> {
        self.take_unacked(channel, tag)?;
        self.dispatch_all();
        Ok(())
    }

    fn nack(&mut self, channel: u64, tag: u64, requeue: bool) -> Result<()> {
        let entry = self.take_unacked(channel, tag)?;
        if requeue {
            let mut message = entry.message;
            message.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.messages.push_front(message);
            }
        } else {
            self.dead_letter(&entry.queue, entry.message, "rejected");
        }
        self.dispatch_all();
        Ok(())
    }

    fn consume(
        &mut self,
        connection: u64,
        channel: u64,
        queue_name: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<RawDeliveryStream> {
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };

        let queue = self.queue_mut(connection, queue_name)?;
        if queue.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !queue.consumers.is_empty())
        {
            return Err(access_refused(format!(
                "queue '{}' in exclusive use",
                queue_name
            )));
        }
        if queue
            .consumers
            .iter()
            .any(|c| c.channel == channel && c.tag == tag)
        {
            return Err(precondition_failed(format!(
                "attempt to reuse consumer tag '{}'",
                tag
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(Consumer {
            tag,
            channel,
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            sender,
        });
        self.dispatch(queue_name);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    fn remove_consumers(&mut self, matches: impl Fn(&Consumer) -> bool) {
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !matches(c));
            if before != queue.consumers.len()
                && queue.consumers.is_empty()
                && queue.spec.auto_delete
            {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.remove_queue(&name);
        }
    }

    fn cancel(&mut self, channel: u64, consumer_tag: &str) {
        self.remove_consumers(|c| c.channel == channel && c.tag == consumer_tag);
    }

    /// Cancels the channel's consumers and requeues its unacked deliveries.
    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };
        self.remove_consumers(|c| c.channel == channel);

        for (_, entry) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        self.dispatch_all();
    }

    /// Closes every channel of the connection and drops its exclusive queues.
    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>> {
    state.lock().map_err(|_| MessagingError::LockError)
}

struct Shared {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    connect_attempts: AtomicU64,
}

/// Broker emulator shared by every connection opened from it.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                connect_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// While unavailable, every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Closes every open connection as if the server went away.
    pub fn drop_connections(&self) {
        if let Ok(mut state) = lock(&self.shared.state) {
            let open: Vec<u64> = state.connections.iter().copied().collect();
            for connection in open {
                state.close_connection(connection);
            }
        }
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = lock(&self.shared.state).ok()?;
        state.queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        let state = lock(&self.shared.state).ok()?;
        state.queues.get(queue).map(|q| q.consumers.len())
    }

    /// Deliveries awaiting acknowledgement across all channels.
    pub fn unacked_count(&self) -> usize {
        lock(&self.shared.state)
            .map(|state| state.channels.values().map(|ch| ch.unacked.len()).sum())
            .unwrap_or(0)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        lock(&self.shared.state).map_or(false, |state| state.exchanges.contains_key(exchange))
    }

    pub fn bindings(&self, exchange: &str) -> Vec<BindingSpec> {
        lock(&self.shared.state)
            .ok()
            .and_then(|state| state.exchanges.get(exchange).map(|e| e.bindings.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BrokerConnection>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(MessagingError::ConnectionError(format!(
                "connection refused by {}",
                config.endpoint()
            )));
        }

        let id = {
            let mut state = lock(&self.shared.state)?;
            let id = state.allocate_id();
            state.connections.insert(id);
            id
        };
        debug!(connection = id, "In-memory connection opened");
        Ok(Box::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = lock(&self.shared.state)?;
        if !state.connections.contains(&self.id) {
            return Err(MessagingError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        let id = state.allocate_id();
        state.channels.insert(id, ChannelState::new(self.id));
        Ok(Box::new(MemoryChannel {
            id,
            connection: self.id,
            shared: self.shared.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.shared.state).map_or(false, |state| state.connections.contains(&self.id))
    }

    async fn close(&self) -> Result<()> {
        lock(&self.shared.state)?.close_connection(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.close_connection(self.id);
        }
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = lock(&self.shared.state)?;
        state.check_open(self.connection, self.id)?;
        Ok(state)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.close_channel(self.id);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.shared.state).map_or(false, |state| {
            state.check_open(self.connection, self.id).is_ok()
        })
    }

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()> {
        let mut state = self.state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn enable_confirms(&mut self) -> Result<()> {
        let mut state = self.state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirms = true;
        }
        Ok(())
    }

    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        let mut state = self.state()?;
        let result = state.declare_exchange(spec);
        state.settle(self.id, result)
    }

    async fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<()> {
        let mut state = self.state()?;
        let result = state.delete_exchange(name, if_unused);
        state.settle(self.id, result)
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueInfo> {
        let mut state = self.state()?;
        let result = state.declare_queue(self.connection, spec);
        state.settle(self.id, result)
    }

    async fn inspect_queue(&mut self, name: &str) -> Result<QueueInfo> {
        let mut state = self.state()?;
        let result = state.queue_mut(self.connection, name).map(|q| q.info());
        state.settle(self.id, result)
    }

    async fn bind_queue(&mut self, binding: &BindingSpec) -> Result<()> {
        let mut state = self.state()?;
        let result = state.bind_queue(self.connection, binding);
        state.settle(self.id, result)
    }

    async fn unbind_queue(&mut self, binding: &BindingSpec) -> Result<()> {
        let mut state = self.state()?;
        let result = state.unbind_queue(self.connection, binding);
        state.settle(self.id, result)
    }

    async fn purge_queue(&mut self, name: &str) -> Result<u32> {
        let mut state = self.state()?;
        let result = state.purge_queue(self.connection, name);
        state.settle(self.id, result)
    }

    async fn delete_queue(&mut self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let mut state = self.state()?;
        let result = state.delete_queue(self.connection, name, if_unused, if_empty);
        state.settle(self.id, result)
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome> {
        let mut state = self.state()?;
        let result = state.publish(self.id, exchange, routing_key, body, properties, mandatory);
        state.settle(self.id, result)
    }

    async fn get(&mut self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>> {
        let mut state = self.state()?;
        let result = state.get(self.connection, self.id, queue, auto_ack);
        state.settle(self.id, result)
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state()?;
        let result = state.ack(self.id, delivery_tag);
        state.settle(self.id, result)
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state()?;
        let result = state.nack(self.id, delivery_tag, requeue);
        state.settle(self.id, result)
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<RawDeliveryStream> {
        let mut state = self.state()?;
        let result = state.consume(self.connection, self.id, queue, consumer_tag, options);
        state.settle(self.id, result)
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state()?;
        state.cancel(self.id, consumer_tag);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        lock(&self.shared.state)?.close_channel(self.id);
        Ok(())
    }
}
