//! W3C baggage: an ordered set of key/value entries carried alongside the
//! trace context.
//!
//! Header form is `key1=value1,key2=value2`. Keys and values are
//! percent-encoded on the way out and decoded on the way in, so any UTF-8
//! string survives the round trip. Member properties (`;prop=x`) are accepted
//! and dropped.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Upper bound on members kept when decoding a header.
pub const MAX_BAGGAGE_MEMBERS: usize = 180;

/// Everything except RFC 3986 unreserved characters is escaped.
const BAGGAGE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Ordered baggage entries with unique keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Baggage {
    entries: Vec<(String, String)>,
}

impl Baggage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing the value in place if the key exists.
    ///
    /// Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the `baggage` header value.
    pub(crate) fn to_header(&self) -> String {
        let mut out = String::new();
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.extend(utf8_percent_encode(k, BAGGAGE_ENCODE_SET));
            out.push('=');
            out.extend(utf8_percent_encode(v, BAGGAGE_ENCODE_SET));
        }
        out
    }

    /// Parses a `baggage` header value. Malformed members are skipped.
    pub(crate) fn from_header(header: &str) -> Self {
        let mut baggage = Baggage::new();
        for member in header.split(',') {
            if baggage.len() >= MAX_BAGGAGE_MEMBERS {
                tracing::debug!(
                    limit = MAX_BAGGAGE_MEMBERS,
                    "baggage member limit reached, ignoring the rest"
                );
                break;
            }
            // Properties after ';' are not modelled
            let pair = member.split(';').next().unwrap_or_default();
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let key = percent_decode(key.trim());
            if key.is_empty() {
                continue;
            }
            baggage.insert(key, percent_decode(value.trim()));
        }
        baggage
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Baggage {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut baggage = Baggage::new();
        for (k, v) in iter {
            baggage.insert(k, v);
        }
        baggage
    }
}

/// Invalid escapes are kept as written; invalid UTF-8 is replaced lossily.
fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
