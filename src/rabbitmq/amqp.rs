// src/rabbitmq/amqp.rs
//! lapin-backed transport talking to a real RabbitMQ server.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::{Map, Number, Value};
use tracing::{debug, info};

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, PublishOutcome, RawDelivery,
    RawDeliveryStream,
};
use super::errors::{MessagingError, Result};
use super::topology::{BindingSpec, ExchangeSpec, ExchangeType, QueueInfo, QueueSpec};
use crate::config::ConnectionConfig;
use crate::message::{FieldArguments, MessageProperties};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ over AMQP 0-9-1 using lapin.
#[derive(Clone, Copy, Debug, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    fn uri(config: &ConnectionConfig) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = config.host.clone();
        uri.authority.port = config.port;
        uri.authority.userinfo.username = config.username.clone();
        uri.authority.userinfo.password = config.password.clone();
        uri.vhost = config.vhost.clone();
        uri.query.heartbeat = Some(config.heartbeat_secs);
        uri.query.connection_timeout = Some(config.connection_timeout_ms);
        uri
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(config.app_id.clone().into());

        let connection = tokio::time::timeout(
            config.connection_timeout(),
            Connection::connect_uri(Self::uri(config), properties),
        )
        .await
        .map_err(|_| {
            MessagingError::ConnectionError(format!(
                "timed out connecting to {}",
                config.endpoint()
            ))
        })?
        .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;

        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel = channel.id(), "AMQP channel opened");
        Ok(Box::new(AmqpChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await?;
        info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn enable_confirms(&mut self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: spec.internal,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                options,
                field_table(&spec.arguments),
            )
            .await?;
        Ok(())
    }

    async fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<()> {
        let options = ExchangeDeleteOptions {
            if_unused,
            ..ExchangeDeleteOptions::default()
        };
        self.channel.exchange_delete(name, options).await?;
        Ok(())
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<QueueInfo> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, field_table(&spec.arguments))
            .await?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn inspect_queue(&mut self, name: &str) -> Result<QueueInfo> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&mut self, binding: &BindingSpec) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                field_table(&binding.arguments),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(&mut self, binding: &BindingSpec) -> Result<()> {
        self.channel
            .queue_unbind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                field_table(&binding.arguments),
            )
            .await?;
        Ok(())
    }

    async fn purge_queue(&mut self, name: &str) -> Result<u32> {
        Ok(self
            .channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await?)
    }

    async fn delete_queue(&mut self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let options = QueueDeleteOptions {
            if_unused,
            if_empty,
            ..QueueDeleteOptions::default()
        };
        Ok(self.channel.queue_delete(name, options).await?)
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome> {
        let options = BasicPublishOptions {
            mandatory,
            ..BasicPublishOptions::default()
        };
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                body,
                basic_properties(properties),
            )
            .await?
            .await?;

        Ok(match confirmation {
            Confirmation::Ack(Some(_)) => PublishOutcome::Returned,
            Confirmation::Ack(None) => PublishOutcome::Confirmed,
            Confirmation::Nack(_) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::Sent,
        })
    }

    async fn get(&mut self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await?;
        Ok(message.map(|message| raw_delivery(message.delivery)))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.channel.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<RawDeliveryStream> {
        let consume_options = BasicConsumeOptions {
            no_ack: options.auto_ack,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, consume_options, FieldTable::default())
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(raw_delivery).map_err(MessagingError::from))
            .boxed())
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "Normal shutdown").await?;
        Ok(())
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn raw_delivery(delivery: lapin::message::Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        body: delivery.data,
    }
}

pub(crate) fn field_table(arguments: &FieldArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

pub(crate) fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => AMQPValue::LongLongInt(int),
            (None, Some(float)) => AMQPValue::Double(float),
            (None, None) => AMQPValue::Void,
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, nested) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(nested));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

pub(crate) fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(n) => Number::from_f64(f64::from(*n)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(text) => Value::String(text.as_str().to_string()),
        AMQPValue::LongString(text) => {
            Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => Value::Array(items.as_slice().iter().map(json_value).collect()),
        AMQPValue::FieldTable(table) => Value::Object(json_object(table)),
        _ => Value::Null,
    }
}

fn json_object(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}

fn field_arguments(table: &FieldTable) -> FieldArguments {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}

pub(crate) fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    if let Some(encoding) = &properties.content_encoding {
        basic = basic.with_content_encoding(encoding.clone().into());
    }
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(field_table(&properties.headers));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.clone().into());
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(expiration.clone().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.clone().into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(kind) = &properties.kind {
        basic = basic.with_kind(kind.clone().into());
    }
    if let Some(user_id) = &properties.user_id {
        basic = basic.with_user_id(user_id.clone().into());
    }
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(app_id.clone().into());
    }
    basic
}

pub(crate) fn message_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        content_type: text(basic.content_type()),
        content_encoding: text(basic.content_encoding()),
        delivery_mode: *basic.delivery_mode(),
        priority: *basic.priority(),
        headers: basic.headers().as_ref().map(field_arguments).unwrap_or_default(),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        expiration: text(basic.expiration()),
        message_id: text(basic.message_id()),
        timestamp: *basic.timestamp(),
        kind: text(basic.kind()),
        user_id: text(basic.user_id()),
        app_id: text(basic.app_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_arguments_keep_their_types() {
        let mut args = FieldArguments::new();
        args.insert("x-message-ttl".into(), json!(86_400_000));
        args.insert("x-dead-letter-exchange".into(), json!("bizmq.dlx"));

        let table = field_table(&args);
        assert_eq!(
            table.inner().get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(86_400_000))
        );
        assert_eq!(field_arguments(&table), args);
    }

    #[test]
    fn properties_survive_the_lapin_representation() {
        let props = MessageProperties::default()
            .with_content_type("application/json")
            .with_correlation_id("req-1")
            .with_expiration_ms(1_500)
            .with_header("attempt", 3)
            .with_header("tags", json!(["a", "b"]));
        let props = MessageProperties {
            delivery_mode: Some(2),
            timestamp: Some(1_700_000_000),
            ..props
        };

        let basic = basic_properties(&props);
        assert_eq!(basic.expiration().as_ref().map(ShortString::as_str), Some("1500"));
        assert_eq!(message_properties(&basic), props);
    }

    #[test]
    fn connection_uri_carries_tuning() {
        let config = ConnectionConfig {
            vhost: "orders".into(),
            ..ConnectionConfig::default()
        };
        let uri = AmqpBroker::uri(&config);
        assert_eq!(uri.vhost, "orders");
        assert_eq!(uri.query.heartbeat, Some(600));
        assert_eq!(uri.authority.port, 5672);
    }
}
