use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Header and argument tables. Values are JSON-shaped and converted to AMQP
/// field values at the transport boundary.
pub type FieldArguments = BTreeMap<String, Value>;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Persistent delivery mode (AMQP `delivery-mode = 2`).
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Body of a message, either supplied by a publisher or decoded from a delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Serializes any `Serialize` value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Json(value) => serde_json::to_vec(value),
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Binary(bytes) => Ok(bytes.clone()),
        }
    }

    /// Decodes a raw body: JSON objects/arrays first, then UTF-8 text, then raw bytes.
    pub fn decode(body: &[u8]) -> Self {
        match std::str::from_utf8(body) {
            Ok(text) => {
                if text.starts_with('{') || text.starts_with('[') {
                    if let Ok(value) = serde_json::from_str::<Value>(text) {
                        return Payload::Json(value);
                    }
                }
                Payload::Text(text.to_string())
            }
            Err(_) => Payload::Binary(body.to_vec()),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Json(_) => JSON_CONTENT_TYPE,
            Payload::Text(_) => TEXT_CONTENT_TYPE,
            Payload::Binary(_) => BINARY_CONTENT_TYPE,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Deserializes a JSON payload into a concrete type.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone()),
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Binary(bytes) => serde_json::from_slice(bytes),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// AMQP basic properties of a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: FieldArguments,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Per-message TTL in milliseconds.
    pub fn with_expiration_ms(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms.to_string());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.headers
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Process-unique identity of an open channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    pub(crate) fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// A broker delivery tag together with the channel that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag {
    pub channel: ChannelId,
    pub tag: u64,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.tag)
    }
}

/// A message received from a queue.
#[derive(Clone, Debug, Serialize)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn payload(&self) -> Payload {
        Payload::decode(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_prefers_json_objects() {
        let payload = Payload::decode(br#"{"order_id": 42}"#);
        assert_eq!(payload, Payload::Json(json!({"order_id": 42})));
    }

    #[test]
    fn decode_keeps_malformed_json_as_text() {
        let payload = Payload::decode(b"{not json");
        assert_eq!(payload, Payload::Text("{not json".to_string()));
    }

    #[test]
    fn decode_does_not_parse_bare_scalars() {
        assert_eq!(Payload::decode(b"42"), Payload::Text("42".to_string()));
    }

    #[test]
    fn decode_falls_back_to_bytes() {
        let raw = vec![0xff, 0xfe, 0x00];
        assert_eq!(Payload::decode(&raw), Payload::Binary(raw.clone()));
    }

    #[test]
    fn typed_payloads_parse_back() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Order {
            order_id: u32,
        }

        let payload = Payload::json(&Order { order_id: 7 }).unwrap();
        let decoded = Payload::decode(&payload.encode().unwrap());
        assert_eq!(decoded.parse::<Order>().unwrap(), Order { order_id: 7 });
    }

    #[test]
    fn created_at_header_is_parsed() {
        let props = MessageProperties::default().with_header("created_at", "2024-05-01T10:00:00Z");
        let created = props.created_at().unwrap();
        assert_eq!(created.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn channel_ids_are_unique() {
        assert_ne!(ChannelId::next(), ChannelId::next());
    }
}
