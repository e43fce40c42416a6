//! Splitting oversized payloads into chunks and joining them back.
//!
//! Chunks of one message share the `x-chunk-id` header and carry their
//! position in `x-chunk-index` out of `x-chunk-count`. The reassembler keeps
//! incomplete groups in the consumer's [`SequenceStore`] across batches and
//! journals what each batch touched so the batch can be committed or undone.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::envelope::{Offset, RawMessage};
use crate::errors::BridgeResult;
use crate::headers::{CHUNK_COUNT_HEADER, CHUNK_ID_HEADER, CHUNK_INDEX_HEADER, MessageHeaders};
use crate::sequence::{Sequence, SequenceError, SequenceKindTag, SequenceStatus, SequenceStore};
use crate::transport::{PublishTransport, SharedPublishTransport};

/// Chunk coordinates read from message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub group_id: String,
    pub index: usize,
    pub count: usize,
}

impl ChunkHeader {
    /// `Ok(None)` when the message is not a chunk at all.
    pub fn from_headers(headers: &MessageHeaders) -> Result<Option<Self>, SequenceError> {
        let Some(group_id) = headers.get(CHUNK_ID_HEADER) else {
            return Ok(None);
        };
        let index = parse_header(headers, CHUNK_INDEX_HEADER)?;
        let count = parse_header(headers, CHUNK_COUNT_HEADER)?;
        if count == 0 {
            return Err(SequenceError::InvalidChunkHeader {
                header: CHUNK_COUNT_HEADER,
                reason: "count must be at least 1".into(),
            });
        }
        if index >= count {
            return Err(SequenceError::InvalidChunkHeader {
                header: CHUNK_INDEX_HEADER,
                reason: format!("index {index} is not below count {count}"),
            });
        }
        Ok(Some(Self {
            group_id: group_id.to_string(),
            index,
            count,
        }))
    }

    pub fn is_chunk(headers: &MessageHeaders) -> bool {
        headers.contains(CHUNK_ID_HEADER)
    }
}

fn parse_header(headers: &MessageHeaders, name: &'static str) -> Result<usize, SequenceError> {
    let value = headers.get(name).ok_or_else(|| SequenceError::InvalidChunkHeader {
        header: name,
        reason: "missing".into(),
    })?;
    value.parse().map_err(|_| SequenceError::InvalidChunkHeader {
        header: name,
        reason: format!("`{value}` is not an index"),
    })
}

/// Splits `message` into chunks of at most `chunk_size` payload bytes.
///
/// An empty payload still yields one chunk, so the receiver sees a group.
pub fn split_into_chunks(message: &RawMessage, chunk_size: usize, group_id: &str) -> Vec<RawMessage> {
    let chunk_size = chunk_size.max(1);
    let pieces: Vec<Bytes> = if message.payload.is_empty() {
        vec![Bytes::new()]
    } else {
        (0..message.payload.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(message.payload.len());
                message.payload.slice(start..end)
            })
            .collect()
    };
    let count = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, payload)| {
            let mut headers = message.headers.clone();
            headers.replace(CHUNK_ID_HEADER, group_id);
            headers.replace(CHUNK_INDEX_HEADER, index.to_string());
            headers.replace(CHUNK_COUNT_HEADER, count.to_string());
            RawMessage {
                payload,
                headers,
                endpoint: message.endpoint.clone(),
                offset: message.offset.clone(),
            }
        })
        .collect()
}

#[derive(Debug)]
struct JournalEntry {
    sequence: Arc<Sequence>,
    index: usize,
}

/// Joins chunk groups, one consumer session at a time.
pub struct ChunkReassembler {
    store: Arc<SequenceStore>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl ChunkReassembler {
    pub fn new(store: Arc<SequenceStore>) -> Self {
        Self {
            store,
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<SequenceStore> {
        &self.store
    }

    fn journal(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a chunk to its group and returns the joined message once the group
    /// is complete. Messages without chunk headers pass through unchanged.
    ///
    /// A chunk whose index is already held by the pending group, or whose
    /// declared count differs, starts a new group and aborts the old one.
    pub fn join_if_complete(&self, message: &RawMessage) -> BridgeResult<Option<RawMessage>> {
        let Some(chunk) = ChunkHeader::from_headers(&message.headers)? else {
            return Ok(Some(message.clone()));
        };

        let sequence = match self
            .store
            .get_kind(&chunk.group_id, false, SequenceKindTag::Chunk)
        {
            Some(existing)
                if existing.is_pending()
                    && existing.expected() == Some(chunk.count)
                    && !existing.contains(chunk.index) =>
            {
                existing
            }
            _ => self.store.add(Sequence::chunk(&chunk.group_id, chunk.count))?,
        };

        let status = sequence.add_member(chunk.index, message.clone())?;
        trace!(
            chunk_id = %chunk.group_id,
            index = chunk.index,
            count = chunk.count,
            "chunk added"
        );
        self.journal().push(JournalEntry {
            sequence: sequence.clone(),
            index: chunk.index,
        });

        if status != SequenceStatus::Complete {
            return Ok(None);
        }
        debug!(chunk_id = %chunk.group_id, count = chunk.count, "chunk group complete");
        Ok(Some(join(&sequence.members(), message)))
    }

    /// Forgets the groups completed since the last commit or rollback.
    pub fn commit(&self) {
        let entries = std::mem::take(&mut *self.journal());
        for sequence in distinct(&entries) {
            if sequence.is_complete() {
                self.store.remove_sequence(sequence);
            }
        }
    }

    /// Takes back every chunk added since the last commit or rollback.
    pub fn rollback(&self) {
        let entries = std::mem::take(&mut *self.journal());
        if entries.is_empty() {
            return;
        }
        for entry in entries.iter().rev() {
            entry.sequence.remove_member(entry.index);
        }
        for sequence in distinct(&entries) {
            if sequence.is_empty() {
                self.store.remove_sequence(sequence);
            }
        }
        debug!(chunks = entries.len(), "chunk batch rolled back");
    }
}

fn distinct(entries: &[JournalEntry]) -> Vec<&Arc<Sequence>> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|entry| seen.insert(Arc::as_ptr(&entry.sequence)))
        .map(|entry| &entry.sequence)
        .collect()
}

/// Joined message: concatenated payload, headers and offset of the chunk that
/// completed the group, chunk headers stripped.
fn join(members: &[RawMessage], last: &RawMessage) -> RawMessage {
    let mut payload = BytesMut::with_capacity(members.iter().map(|m| m.payload.len()).sum());
    for member in members {
        payload.extend_from_slice(&member.payload);
    }
    let mut headers = last.headers.clone();
    headers.remove(CHUNK_ID_HEADER);
    headers.remove(CHUNK_INDEX_HEADER);
    headers.remove(CHUNK_COUNT_HEADER);
    RawMessage {
        payload: payload.freeze(),
        headers,
        endpoint: last.endpoint.clone(),
        offset: last.offset.clone(),
    }
}

/// Publish transport that splits payloads above `chunk_size` before handing
/// them to the wrapped transport. Returns the offset of the last chunk.
pub struct ChunkingTransport {
    inner: SharedPublishTransport,
    chunk_size: usize,
}

impl ChunkingTransport {
    pub fn new(inner: SharedPublishTransport, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }

    fn split(&self, message: &RawMessage) -> Option<Vec<RawMessage>> {
        if message.payload.len() <= self.chunk_size {
            return None;
        }
        let group_id = message
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Some(split_into_chunks(message, self.chunk_size, &group_id))
    }
}

#[async_trait]
impl PublishTransport for ChunkingTransport {
    fn publish(&self, message: &RawMessage) -> BridgeResult<Option<Offset>> {
        let Some(chunks) = self.split(message) else {
            return self.inner.publish(message);
        };
        let mut last = None;
        for chunk in &chunks {
            last = self.inner.publish(chunk)?;
        }
        Ok(last)
    }

    async fn publish_async(&self, message: &RawMessage) -> BridgeResult<Option<Offset>> {
        let Some(chunks) = self.split(message) else {
            return self.inner.publish_async(message).await;
        };
        let mut last = None;
        for chunk in &chunks {
            last = self.inner.publish_async(chunk).await?;
        }
        Ok(last)
    }
}
