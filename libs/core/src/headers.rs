//! Ordered, copy-on-write header multimap carried by every envelope.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Header carrying the logical message identifier.
pub const MESSAGE_ID_HEADER: &str = "x-message-id";
/// Header carrying the chunk group identifier.
pub const CHUNK_ID_HEADER: &str = "x-chunk-id";
/// Header carrying the zero-based chunk index.
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
/// Header carrying the total number of chunks in the group.
pub const CHUNK_COUNT_HEADER: &str = "x-chunk-count";

/// A single header entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Display for MessageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Ordered multimap of headers.
///
/// Clones share storage; the first mutation on a shared instance copies it, so a
/// stage editing its envelope's headers never affects another envelope.
///
/// ```
/// use bridge_core::MessageHeaders;
///
/// let mut original = MessageHeaders::new();
/// original.add("x-tenant", "acme");
/// let mut copy = original.clone();
/// copy.replace("x-tenant", "bravo");
/// assert_eq!(original.get("x-tenant"), Some("acme"));
/// assert_eq!(copy.get("x-tenant"), Some("bravo"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    entries: Arc<Vec<MessageHeader>>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any existing entries with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.entries).push(MessageHeader::new(name, value));
    }

    /// Replaces every entry named `name` with a single entry, appending when absent.
    pub fn replace(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let entries = Arc::make_mut(&mut self.entries);
        match entries.iter().position(|h| h.name == name) {
            Some(first) => {
                entries[first].value = value;
                let mut idx = 0;
                entries.retain(|h| {
                    let keep = idx <= first || h.name != name;
                    idx += 1;
                    keep
                });
            }
            None => entries.push(MessageHeader { name, value }),
        }
    }

    /// Adds the header only when no entry with that name exists yet.
    pub fn add_if_missing(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.add(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) {
        if self.contains(name) {
            Arc::make_mut(&mut self.entries).retain(|h| h.name != name);
        }
    }

    /// First value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageHeader> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `other` shares the same backing storage.
    pub fn shares_storage_with(&self, other: &MessageHeaders) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(
                iter.into_iter()
                    .map(|(n, v)| MessageHeader::new(n, v))
                    .collect(),
            ),
        }
    }
}

impl Serialize for MessageHeaders {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageHeaders {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<MessageHeader>::deserialize(deserializer)?;
        Ok(Self {
            entries: Arc::new(entries),
        })
    }
}
