//! Outbound queue: producing into a store instead of a broker.
//!
//! The outbound queue producer serializes messages and appends them to an
//! [`OutboxWriter`], usually inside the caller's own transaction. A relay
//! process drains the queue to the real broker later, so nothing here ever
//! yields a broker offset.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::SharedCodec;
use crate::endpoint::ProducerEndpoint;
use crate::envelope::{Offset, RawMessage};
use crate::errors::{BridgeError, BridgeResult};
use crate::headers::MessageHeaders;
use crate::pipeline::SharedBehavior;
use crate::producer::{Producer, ProducerContext};
use crate::transport::PublishTransport;

/// One queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundQueueEntry {
    pub id: Uuid,
    pub endpoint: String,
    pub headers: MessageHeaders,
    pub payload: Bytes,
    pub created_at: OffsetDateTime,
}

impl OutboundQueueEntry {
    pub fn from_raw(message: &RawMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: message.endpoint.clone(),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Raw message a relay publishes for this entry.
    pub fn to_raw(&self) -> RawMessage {
        RawMessage::new(self.endpoint.clone(), self.payload.clone()).with_headers(self.headers.clone())
    }
}

/// Destination of the outbound queue.
#[async_trait]
pub trait OutboxWriter: Send + Sync {
    async fn enqueue(&self, entry: OutboundQueueEntry) -> anyhow::Result<()>;
}

pub type SharedOutboxWriter = Arc<dyn OutboxWriter>;

/// FIFO outbound queue held in memory.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    entries: Arc<Mutex<VecDeque<OutboundQueueEntry>>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<OutboundQueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Copies of the queued entries, oldest first.
    pub fn snapshot(&self) -> Vec<OutboundQueueEntry> {
        self.entries().iter().cloned().collect()
    }

    /// Removes and returns up to `max` of the oldest entries.
    pub fn dequeue(&self, max: usize) -> Vec<OutboundQueueEntry> {
        let mut entries = self.entries();
        let take = max.min(entries.len());
        entries.drain(..take).collect()
    }
}

#[async_trait]
impl OutboxWriter for InMemoryOutbox {
    async fn enqueue(&self, entry: OutboundQueueEntry) -> anyhow::Result<()> {
        self.entries().push_back(entry);
        Ok(())
    }
}

/// Buffers entries until the surrounding unit of work commits.
///
/// Entries reach the wrapped writer on [`commit`](Self::commit); a
/// [`rollback`](Self::rollback) discards them.
pub struct TransactionalOutbox {
    inner: SharedOutboxWriter,
    pending: Mutex<Vec<OutboundQueueEntry>>,
}

impl TransactionalOutbox {
    pub fn new(inner: SharedOutboxWriter) -> Self {
        Self {
            inner,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<OutboundQueueEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Writes the buffered entries in order. On failure the unwritten entries
    /// stay buffered so the commit can be retried.
    pub async fn commit(&self) -> anyhow::Result<usize> {
        let entries = std::mem::take(&mut *self.pending());
        let total = entries.len();
        let mut remaining = entries.into_iter();
        while let Some(entry) = remaining.next() {
            if let Err(err) = self.inner.enqueue(entry.clone()).await {
                let mut pending = self.pending();
                let appended_since = std::mem::take(&mut *pending);
                pending.push(entry);
                pending.extend(remaining);
                pending.extend(appended_since);
                warn!(error = %err, unwritten = pending.len(), "outbox commit failed");
                return Err(err);
            }
        }
        debug!(entries = total, "outbox committed");
        Ok(total)
    }

    /// Drops the buffered entries and returns how many were discarded.
    pub fn rollback(&self) -> usize {
        let discarded = std::mem::take(&mut *self.pending()).len();
        debug!(entries = discarded, "outbox rolled back");
        discarded
    }
}

#[async_trait]
impl OutboxWriter for TransactionalOutbox {
    async fn enqueue(&self, entry: OutboundQueueEntry) -> anyhow::Result<()> {
        self.pending().push(entry);
        Ok(())
    }
}

/// Publish transport writing to an outbound queue. Only the async path exists.
pub struct OutboundQueueTransport {
    writer: SharedOutboxWriter,
}

impl OutboundQueueTransport {
    pub fn new(writer: SharedOutboxWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl PublishTransport for OutboundQueueTransport {
    fn publish(&self, _message: &RawMessage) -> BridgeResult<Option<Offset>> {
        Err(BridgeError::UnsupportedOperation(
            "the outbound queue only supports asynchronous produce",
        ))
    }

    async fn publish_async(&self, message: &RawMessage) -> BridgeResult<Option<Offset>> {
        let entry = OutboundQueueEntry::from_raw(message);
        let entry_id = entry.id;
        self.writer
            .enqueue(entry)
            .await
            .map_err(|err| BridgeError::publish(message.endpoint.clone(), err))?;
        debug!(endpoint = %message.endpoint, entry_id = %entry_id, "message enqueued in outbound queue");
        Ok(None)
    }
}

/// Producer whose transport is an outbound queue.
pub struct OutboundQueueProducer<M: Send + Sync + 'static> {
    producer: Producer<M>,
}

impl<M> OutboundQueueProducer<M>
where
    M: Send + Sync + 'static,
{
    pub fn new(
        endpoint: ProducerEndpoint,
        codec: SharedCodec<M>,
        writer: SharedOutboxWriter,
    ) -> BridgeResult<Self> {
        let transport = Arc::new(OutboundQueueTransport::new(writer));
        Ok(Self {
            producer: Producer::new(endpoint, codec, transport)?,
        })
    }

    pub fn with_behavior(mut self, behavior: SharedBehavior<ProducerContext<M>>) -> Self {
        self.producer = self.producer.with_behavior(behavior);
        self
    }

    /// Always fails with [`BridgeError::UnsupportedOperation`].
    pub fn produce(&self, message: M, headers: MessageHeaders) -> BridgeResult<Option<Offset>> {
        self.producer.produce(message, headers)
    }

    /// Enqueues the message; resolves to `None` since no broker was involved.
    pub async fn produce_async(&self, message: M, headers: MessageHeaders) -> BridgeResult<Option<Offset>> {
        self.producer.produce_async(message, headers).await
    }

    pub fn into_inner(self) -> Producer<M> {
        self.producer
    }
}
