//! Flat key/value carriers for moving trace context through message headers.
//!
//! Broker headers may hold raw bytes (AMQP field tables usually do) or
//! strings. [`HeaderValue`] models both and the [`Extractor`] view decodes
//! bytes as UTF-8 on read.

use std::borrow::Cow;
use std::collections::HashMap;

/// A single header value as stored by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Returns the value as text, or `None` if the bytes are not UTF-8.
    pub fn as_str(&self) -> Option<Cow<'_, str>> {
        match self {
            HeaderValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
            HeaderValue::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        HeaderValue::Bytes(value)
    }
}

impl From<&[u8]> for HeaderValue {
    fn from(value: &[u8]) -> Self {
        HeaderValue::Bytes(value.to_vec())
    }
}

/// Message metadata: header key to raw value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Carrier {
    headers: HashMap<String, HeaderValue>,
}

impl Carrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn get_raw(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Re-encodes every text value as bytes, the way AMQP clients hand
    /// headers back to consumers.
    pub fn into_byte_values(self) -> Self {
        let headers = self
            .headers
            .into_iter()
            .map(|(k, v)| match v {
                HeaderValue::Text(s) => (k, HeaderValue::Bytes(s.into_bytes())),
                bytes @ HeaderValue::Bytes(_) => (k, bytes),
            })
            .collect();
        Self { headers }
    }
}

impl<K: Into<String>, V: Into<HeaderValue>> FromIterator<(K, V)> for Carrier {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            headers: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Read side of a carrier.
pub trait Extractor {
    /// Returns the value stored under `key`, decoded as text.
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;

    /// All keys present in the carrier.
    fn keys(&self) -> Vec<&str>;
}

/// Write side of a carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

impl Extractor for Carrier {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        if let Some(value) = self.headers.get(key) {
            return value.as_str();
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

impl Injector for Carrier {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_string(), HeaderValue::Text(value));
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        if let Some(value) = HashMap::get(self, key) {
            return Some(Cow::Borrowed(value.as_str()));
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| Cow::Borrowed(v.as_str()))
    }

    fn keys(&self) -> Vec<&str> {
        HashMap::keys(self).map(String::as_str).collect()
    }
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_values_decode_as_text() {
        let mut carrier = Carrier::new();
        carrier.insert("traceparent", b"00-abc".to_vec());
        assert_eq!(carrier.get("traceparent").as_deref(), Some("00-abc"));
    }

    #[test]
    fn test_invalid_utf8_reads_as_absent() {
        let mut carrier = Carrier::new();
        carrier.insert("baggage", vec![0xff, 0xfe]);
        assert!(carrier.get("baggage").is_none());
    }

    #[test]
    fn test_lookup_falls_back_to_case_insensitive() {
        let carrier: Carrier = [("TraceParent", "x")].into_iter().collect();
        assert_eq!(carrier.get("traceparent").as_deref(), Some("x"));

        let map: HashMap<String, String> =
            [("Baggage".to_string(), "a=1".to_string())].into_iter().collect();
        assert_eq!(Extractor::get(&map, "baggage").as_deref(), Some("a=1"));
    }

    #[test]
    fn test_into_byte_values() {
        let carrier: Carrier = [("k", "v")].into_iter().collect();
        let carrier = carrier.into_byte_values();
        assert_eq!(carrier.get_raw("k"), Some(&HeaderValue::Bytes(b"v".to_vec())));
        assert_eq!(carrier.get("k").as_deref(), Some("v"));
    }
}
