use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::headers::{MESSAGE_ID_HEADER, MessageHeaders};

/// Broker-assigned position of a message.
///
/// `key` names the ordered log the position belongs to (a partition, a stream),
/// `value` is the position inside it. Both are opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub key: String,
    pub value: String,
}

impl Offset {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.value)
    }
}

/// Serialized message as exchanged with a broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub payload: Bytes,
    pub headers: MessageHeaders,
    pub endpoint: String,
    pub offset: Option<Offset>,
}

impl RawMessage {
    pub fn new(endpoint: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: MessageHeaders::new(),
            endpoint: endpoint.into(),
            offset: None,
        }
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MESSAGE_ID_HEADER)
    }
}

/// Unit flowing through a producer or consumer pipeline.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    pub message: Option<M>,
    pub raw: Option<Bytes>,
    pub headers: MessageHeaders,
    pub endpoint: String,
    pub offset: Option<Offset>,
    /// Set when the payload is the final message rather than a wrapper around it.
    pub must_unwrap: bool,
}

impl<M> Envelope<M> {
    /// Outbound envelope for an application message, not yet serialized.
    pub fn outbound(message: M, headers: MessageHeaders, endpoint: impl Into<String>) -> Self {
        Self {
            message: Some(message),
            raw: None,
            headers,
            endpoint: endpoint.into(),
            offset: None,
            must_unwrap: false,
        }
    }

    /// Inbound envelope wrapping a raw broker message, not yet deserialized.
    pub fn inbound(raw: RawMessage) -> Self {
        Self {
            message: None,
            raw: Some(raw.payload),
            headers: raw.headers,
            endpoint: raw.endpoint,
            offset: raw.offset,
            must_unwrap: false,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MESSAGE_ID_HEADER)
    }

    /// Raw view handed to transports; `None` until the envelope is serialized.
    pub fn to_raw(&self) -> Option<RawMessage> {
        self.raw.as_ref().map(|payload| RawMessage {
            payload: payload.clone(),
            headers: self.headers.clone(),
            endpoint: self.endpoint.clone(),
            offset: self.offset.clone(),
        })
    }
}
