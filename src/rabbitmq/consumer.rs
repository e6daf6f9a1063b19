use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{Broker, ConsumeOptions};
use super::channel_manager::{ChannelConfig, ChannelHandle};
use super::connection::ConnectionManager;
use super::errors::{MessagingError, Result};
use super::handler::{AckChannel, DeliveryHandler};
use crate::config::{ConnectionConfig, ReconnectPolicy};
use crate::message::{Delivery, DeliveryTag};

/// Deliveries of one subscription, already tied to the channel they came from.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Builds a consumer tag that names the queue it belongs to.
pub(crate) fn consumer_tag(queue: &str) -> String {
    format!("bizmq-{}-{}", queue, &Uuid::new_v4().simple().to_string()[..8])
}

impl ChannelHandle {
    /// Fetches a single message, `None` when the queue is empty.
    pub async fn get_message(&mut self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>> {
        let id = self.id();
        match self.raw().get(queue, auto_ack).await {
            Ok(Some(raw)) => {
                let delivery = raw.on_channel(id);
                debug!(queue = %queue, tag = %delivery.delivery_tag, "Message fetched");
                Ok(Some(delivery))
            }
            Ok(None) => {
                debug!(queue = %queue, "Queue is empty");
                Ok(None)
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to fetch message");
                Err(e)
            }
        }
    }

    fn check_owner(&self, tag: DeliveryTag) -> Result<()> {
        if self.owns(&tag) {
            return Ok(());
        }
        error!(
            tag = %tag,
            channel = %self.id(),
            "Delivery tag belongs to another channel; refusing to forward it"
        );
        Err(MessagingError::StaleDeliveryTag { tag })
    }

    pub async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.check_owner(tag)?;
        self.raw().ack(tag.tag).await.map_err(|e| {
            error!(tag = %tag, error = %e, "Failed to acknowledge message");
            e
        })?;
        debug!(tag = %tag, "Message acknowledged");
        Ok(())
    }

    pub async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.check_owner(tag)?;
        self.raw().nack(tag.tag, requeue).await.map_err(|e| {
            error!(tag = %tag, error = %e, "Failed to negatively acknowledge message");
            e
        })?;
        debug!(tag = %tag, requeue, "Message negatively acknowledged");
        Ok(())
    }

    /// Starts a `basic.consume` subscription and returns its deliveries.
    pub async fn subscribe(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let id = self.id();
        let stream = self
            .raw()
            .consume(queue, consumer_tag, options)
            .await
            .map_err(|e| {
                error!(queue = %queue, error = %e, "Failed to start consumer");
                e
            })?;
        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");
        Ok(stream
            .map(move |delivery| delivery.map(|raw| raw.on_channel(id)))
            .boxed())
    }

    /// Runs `handler` for every delivery until `cancel` fires, the broker
    /// cancels the consumer or the channel fails.
    ///
    /// Cancellation is observed between deliveries; a running handler always
    /// completes.
    pub async fn consume_messages(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        handler: &dyn DeliveryHandler,
        options: &ConsumeOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut deliveries = self.subscribe(queue, consumer_tag, options).await?;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(true),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    debug!(queue = %queue, tag = %delivery.delivery_tag, "Message received");
                    let mut channel = AckChannel::new(self);
                    handler.handle(&mut channel, delivery).await;
                }
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "Error receiving message");
                    break Err(e);
                }
                None if self.is_open() => {
                    warn!(queue = %queue, "Consumer cancelled by broker");
                    break Ok(false);
                }
                None => {
                    error!(queue = %queue, "Channel closed while consuming");
                    break Err(MessagingError::ChannelError(format!(
                        "channel closed while consuming from '{}'",
                        queue
                    )));
                }
            }
        };

        drop(deliveries);
        match outcome {
            Ok(true) => {
                if let Err(e) = self.raw().cancel(consumer_tag).await {
                    warn!(queue = %queue, error = %e, "Failed to cancel consumer");
                }
                info!(queue = %queue, channel = %self.label(), "Consumer stopped");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Returned by [`ConsumerRegistry::spawn`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub queue: String,
    pub consumer_tag: String,
}

/// What a background worker needs to open its own connection.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectPolicy,
    pub prefetch_count: u16,
}

struct ConsumerRegistration {
    consumer_tag: String,
    cancel: CancellationToken,
    /// Taken while a stop is joining the worker.
    handle: Option<JoinHandle<()>>,
}

impl ConsumerRegistration {
    fn is_live(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| !handle.is_finished())
    }
}

#[derive(Default)]
struct RegistryState {
    workers: HashMap<String, ConsumerRegistration>,
    /// Parent of every worker token; replaced by each shutdown.
    shutdown: CancellationToken,
}

/// Background consumers keyed by queue, at most one per queue.
#[derive(Default)]
pub struct ConsumerRegistry {
    state: Mutex<RegistryState>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(|_| MessagingError::LockError)
    }

    /// Starts a worker task consuming `queue` on its own connection.
    pub(crate) fn spawn(
        &self,
        context: WorkerContext,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle> {
        let mut state = self.state()?;
        let cancel = state.shutdown.child_token();
        let workers = &mut state.workers;
        if let Some(existing) = workers.get(queue) {
            if existing.is_live() {
                warn!(queue = %queue, "A consumer is already active on this queue");
                return Err(MessagingError::ConsumerAlreadyActive(queue.to_string()));
            }
            debug!(queue = %queue, "Replacing finished consumer registration");
        }

        let consumer_tag = consumer_tag(queue);
        let handle = tokio::spawn(run_worker(
            context,
            queue.to_string(),
            consumer_tag.clone(),
            handler,
            options,
            cancel.clone(),
        ));

        workers.insert(
            queue.to_string(),
            ConsumerRegistration {
                consumer_tag: consumer_tag.clone(),
                cancel,
                handle: Some(handle),
            },
        );
        info!(queue = %queue, consumer_tag = %consumer_tag, "Background consumer started");

        Ok(ConsumerHandle {
            queue: queue.to_string(),
            consumer_tag,
        })
    }

    /// Cancels the worker for `queue` and waits up to `join_timeout` for it.
    ///
    /// On timeout the registration is kept and the worker still counts as active.
    pub async fn stop(&self, queue: &str, join_timeout: Duration) -> Result<()> {
        let (mut handle, cancel) = {
            let mut state = self.state()?;
            let workers = &mut state.workers;
            let registration = workers.get_mut(queue).ok_or_else(|| {
                warn!(queue = %queue, "No consumer registered for queue");
                MessagingError::ConsumerNotFound(queue.to_string())
            })?;
            let cancel = registration.cancel.clone();
            let Some(handle) = registration.handle.take() else {
                return Err(MessagingError::ConsumerStopping(queue.to_string()));
            };
            if handle.is_finished() {
                workers.remove(queue);
                info!(queue = %queue, "Consumer had already exited; registration removed");
                return Err(MessagingError::ConsumerNotRunning(queue.to_string()));
            }
            (handle, cancel)
        };

        cancel.cancel();
        match tokio::time::timeout(join_timeout, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!(queue = %queue, error = %e, "Consumer task ended abnormally");
                }
                let removed = self.state()?.workers.remove(queue);
                info!(
                    queue = %queue,
                    consumer_tag = removed.as_ref().map_or("", |r| r.consumer_tag.as_str()),
                    "Consumer stopped"
                );
                Ok(())
            }
            Err(_) => {
                warn!(queue = %queue, timeout = ?join_timeout, "Consumer did not stop in time");
                if let Some(registration) = self.state()?.workers.get_mut(queue) {
                    registration.handle = Some(handle);
                }
                Err(MessagingError::ConsumerStopTimeout {
                    queue: queue.to_string(),
                    timeout: join_timeout,
                })
            }
        }
    }

    /// Cancels every worker registered so far and waits for each, returning
    /// the queues whose worker did not stop in time.
    ///
    /// Cancellation and the list of workers to stop are taken under one lock.
    /// A consumer started after that point gets a fresh token and belongs to
    /// the client's next life.
    pub async fn shutdown(&self, join_timeout: Duration) -> Vec<String> {
        let queues: Vec<String> = match self.state() {
            Ok(mut state) => {
                std::mem::take(&mut state.shutdown).cancel();
                state.workers.keys().cloned().collect()
            }
            Err(e) => {
                error!(error = %e, "Consumer registry unavailable");
                return Vec::new();
            }
        };

        let mut stuck = Vec::new();
        for queue in queues {
            match self.stop(&queue, join_timeout).await {
                Ok(()) | Err(MessagingError::ConsumerNotRunning(_)) => {}
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Consumer not stopped during shutdown");
                    stuck.push(queue);
                }
            }
        }
        stuck
    }

    /// Queues with a live worker, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut queues: Vec<String> = match self.state() {
            Ok(state) => state
                .workers
                .iter()
                .filter(|(_, registration)| registration.is_live())
                .map(|(queue, _)| queue.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        queues.sort();
        queues
    }
}

async fn run_worker(
    context: WorkerContext,
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn DeliveryHandler>,
    options: ConsumeOptions,
    cancel: CancellationToken,
) {
    let mut manager = ConnectionManager::new(context.broker, context.connection)
        .with_reconnect_policy(context.reconnect)
        .with_channel_config(ChannelConfig {
            prefetch_count: context.prefetch_count,
            confirm_mode: false,
            label: format!("consumer:{}", queue),
        });

    let result = async {
        // stoppable while still backing off between connect attempts
        let channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(queue = %queue, "Consumer cancelled before it was connected");
                return Ok(());
            }
            channel = manager.ensure_channel() => channel?,
        };
        channel
            .consume_messages(&queue, &consumer_tag, handler.as_ref(), &options, &cancel)
            .await
    }
    .await;

    if let Err(e) = result {
        error!(queue = %queue, error = %e, "Background consumer failed");
    }
    if let Err(e) = manager.close().await {
        warn!(queue = %queue, error = %e, "Failed to close consumer connection");
    }
}
