use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::headers::MessageHeaders;

/// Converts between application messages and payload bytes. Must be pure.
pub trait Codec<M>: Send + Sync {
    fn serialize(&self, message: &M, headers: &MessageHeaders) -> anyhow::Result<Bytes>;
    fn deserialize(&self, payload: &[u8], headers: &MessageHeaders) -> anyhow::Result<M>;
}

pub type SharedCodec<M> = Arc<dyn Codec<M>>;

/// JSON codec backed by serde.
pub struct JsonCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> JsonCodec<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for JsonCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for JsonCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> Codec<M> for JsonCodec<M>
where
    M: Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &M, _headers: &MessageHeaders) -> anyhow::Result<Bytes> {
        let body = serde_json::to_vec(message).context("serialize message as json")?;
        Ok(Bytes::from(body))
    }

    fn deserialize(&self, payload: &[u8], _headers: &MessageHeaders) -> anyhow::Result<M> {
        serde_json::from_slice(payload).context("deserialize json payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u64,
        note: String,
    }

    #[test]
    fn json_codec_reads_back_what_it_wrote() {
        let codec = JsonCodec::<OrderPlaced>::new();
        let headers = MessageHeaders::new();
        let message = OrderPlaced {
            id: 7,
            note: "rush".into(),
        };
        let bytes = codec.serialize(&message, &headers).unwrap();
        assert_eq!(&bytes[..], br#"{"id":7,"note":"rush"}"#);
        assert_eq!(codec.deserialize(&bytes, &headers).unwrap(), message);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let codec = JsonCodec::<OrderPlaced>::new();
        let err = codec
            .deserialize(b"not json", &MessageHeaders::new())
            .unwrap_err();
        assert!(err.to_string().contains("deserialize json payload"));
    }
}
