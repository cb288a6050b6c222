use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered, string-keyed message headers.
///
/// Insertion order is preserved so headers round-trip through the broker
/// exactly as they were written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(IndexMap<String, Value>);

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Inserts a header, returning the previous value if one existed.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<Value>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.insert(key, value);
        self
    }

    /// Returns the raw value of a header.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a header as a string slice.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Returns a header as an unsigned integer.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Returns a header as a boolean.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Whether a header is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes a header while keeping the order of the others.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copies every header from `other`, overwriting existing keys in place.
    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Headers {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Basic message properties.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    /// Publishing application.
    pub app_id: Option<String>,

    /// Application-level message id.
    pub message_id: Option<String>,

    /// Correlates responses with requests.
    pub correlation_id: Option<String>,

    /// Queue a response should be routed to.
    pub reply_to: Option<String>,

    /// MIME type of the content.
    pub content_type: Option<String>,

    /// Ask the broker to persist the message.
    pub persistent: bool,

    /// Out-of-band metadata.
    pub headers: Headers,
}

/// A message body plus its properties.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Raw content.
    pub content: Bytes,

    /// Properties travelling with the content.
    pub properties: Properties,
}

impl Message {
    /// Creates a message with default properties.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            properties: Properties::default(),
        }
    }

    /// Creates a message with the given properties.
    pub fn with_properties(content: impl Into<Bytes>, properties: Properties) -> Self {
        Self {
            content: content.into(),
            properties,
        }
    }

    /// Shorthand for the message headers.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.properties.headers
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Tag used to acknowledge this delivery.
    pub delivery_tag: u64,

    /// Consumer the delivery was sent to.
    pub consumer_tag: String,

    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Set when the message was delivered before and requeued.
    pub redelivered: bool,

    /// The message.
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_keep_insertion_order() {
        let mut headers = Headers::new()
            .with("key2", "b")
            .with("key1", "a")
            .with("count", 3);

        headers.remove("key1");
        headers.insert("key0", true);

        let keys: Vec<_> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["key2", "count", "key0"]);
        assert_eq!(headers.get_u64("count"), Some(3));
        assert_eq!(headers.get_bool("key0"), Some(true));
        assert_eq!(headers.get_str("key2"), Some("b"));
    }

    #[test]
    fn test_headers_serialize_as_plain_object() {
        let headers = Headers::new().with("z", 1).with("a", "x");
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"z":1,"a":"x"}"#);

        let back: Headers = serde_json::from_str(&json).unwrap();
        assert_eq!(back, headers);
    }
}
