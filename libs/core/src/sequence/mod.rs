//! Named, ordered groups of raw messages tracked together.

mod store;

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use crate::envelope::RawMessage;

pub use store::SequenceStore;

/// Why a pending sequence was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// Superseded by a new sequence under the same identifier.
    IncompleteSequence,
    /// The owning store was disposed.
    Disposing,
    /// The reader stopped enumerating the members.
    EnumerationAborted,
    Error,
    ProcessingError,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncompleteSequence => "incomplete_sequence",
            Self::Disposing => "disposing",
            Self::EnumerationAborted => "enumeration_aborted",
            Self::Error => "error",
            Self::ProcessingError => "processing_error",
        }
    }
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    Pending,
    Complete,
    Aborted(AbortReason),
}

impl SequenceStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl Display for SequenceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Complete => f.write_str("complete"),
            Self::Aborted(reason) => write!(f, "aborted ({reason})"),
        }
    }
}

/// Shape of a sequence and how its completion is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    /// Fragments of one oversized message; complete once every index arrived.
    Chunk { total: usize },
    /// Fixed-size group; complete once `size` members arrived.
    Batch { size: usize },
    /// Open-ended stream; complete only when explicitly closed.
    Unbounded,
}

/// Discriminant of [`SequenceKind`], used for typed lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKindTag {
    Chunk,
    Batch,
    Unbounded,
}

impl SequenceKind {
    pub fn tag(&self) -> SequenceKindTag {
        match self {
            Self::Chunk { .. } => SequenceKindTag::Chunk,
            Self::Batch { .. } => SequenceKindTag::Batch,
            Self::Unbounded => SequenceKindTag::Unbounded,
        }
    }

    /// Expected member count; `None` for unbounded sequences.
    pub fn expected(&self) -> Option<usize> {
        match self {
            Self::Chunk { total } => Some(*total),
            Self::Batch { size } => Some(*size),
            Self::Unbounded => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("sequence `{id}` is {status} and accepts no further members")]
    Closed { id: String, status: SequenceStatus },
    #[error("index {index} is out of range for sequence `{id}` expecting {expected} members")]
    IndexOutOfRange {
        id: String,
        index: usize,
        expected: usize,
    },
    #[error("sequence `{id}` already holds member {index}")]
    DuplicateMember { id: String, index: usize },
    #[error("sequence store {store} has been disposed")]
    StoreDisposed { store: String },
    #[error("invalid chunk header `{header}`: {reason}")]
    InvalidChunkHeader {
        header: &'static str,
        reason: String,
    },
}

struct SequenceState {
    members: BTreeMap<usize, RawMessage>,
    status: SequenceStatus,
}

/// An ordered group of raw messages with a pending/complete/aborted lifecycle.
///
/// Members are kept by index, so readers always see them in index order no
/// matter the order they were added in.
pub struct Sequence {
    id: String,
    kind: SequenceKind,
    is_new: AtomicBool,
    state: Mutex<SequenceState>,
    status_tx: watch::Sender<SequenceStatus>,
}

impl Sequence {
    pub fn new(id: impl Into<String>, kind: SequenceKind) -> Self {
        let (status_tx, _) = watch::channel(SequenceStatus::Pending);
        Self {
            id: id.into(),
            kind,
            is_new: AtomicBool::new(true),
            state: Mutex::new(SequenceState {
                members: BTreeMap::new(),
                status: SequenceStatus::Pending,
            }),
            status_tx,
        }
    }

    pub fn chunk(id: impl Into<String>, total: usize) -> Self {
        Self::new(id, SequenceKind::Chunk { total })
    }

    pub fn batch(id: impl Into<String>, size: usize) -> Self {
        Self::new(id, SequenceKind::Batch { size })
    }

    pub fn unbounded(id: impl Into<String>) -> Self {
        Self::new(id, SequenceKind::Unbounded)
    }

    fn state(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn expected(&self) -> Option<usize> {
        self.kind.expected()
    }

    /// True until the sequence is first read back from a store.
    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub(crate) fn set_is_new(&self, value: bool) {
        self.is_new.store(value, Ordering::Release);
    }

    pub fn status(&self) -> SequenceStatus {
        self.state().status
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_pending()
    }

    pub fn is_complete(&self) -> bool {
        self.status() == SequenceStatus::Complete
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self.status() {
            SequenceStatus::Aborted(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.state().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().members.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.state().members.contains_key(&index)
    }

    /// Snapshot of the members in index order. Still readable after an abort.
    pub fn members(&self) -> Vec<RawMessage> {
        self.state().members.values().cloned().collect()
    }

    /// Adds the member at `index` and returns the resulting status.
    pub fn add_member(&self, index: usize, message: RawMessage) -> Result<SequenceStatus, SequenceError> {
        let mut state = self.state();
        if !state.status.is_pending() {
            return Err(SequenceError::Closed {
                id: self.id.clone(),
                status: state.status,
            });
        }
        if let Some(expected) = self.kind.expected() {
            if index >= expected {
                return Err(SequenceError::IndexOutOfRange {
                    id: self.id.clone(),
                    index,
                    expected,
                });
            }
        }
        if state.members.contains_key(&index) {
            return Err(SequenceError::DuplicateMember {
                id: self.id.clone(),
                index,
            });
        }
        state.members.insert(index, message);
        if self.kind.expected() == Some(state.members.len()) {
            self.transition(&mut state, SequenceStatus::Complete);
        }
        Ok(state.status)
    }

    /// Appends a member after the current last index.
    pub fn push(&self, message: RawMessage) -> Result<SequenceStatus, SequenceError> {
        let next = {
            let state = self.state();
            state.members.keys().next_back().map_or(0, |last| last + 1)
        };
        self.add_member(next, message)
    }

    /// Takes back a member; a complete sequence becomes pending again.
    pub(crate) fn remove_member(&self, index: usize) -> Option<RawMessage> {
        let mut state = self.state();
        let removed = state.members.remove(&index);
        if removed.is_some() && state.status == SequenceStatus::Complete {
            self.transition(&mut state, SequenceStatus::Pending);
        }
        removed
    }

    /// Explicitly closes a pending sequence. Returns `false` if it was not pending.
    pub fn complete(&self) -> bool {
        let mut state = self.state();
        if !state.status.is_pending() {
            return false;
        }
        self.transition(&mut state, SequenceStatus::Complete);
        true
    }

    /// Aborts a pending sequence. Returns `false` if it was not pending.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let mut state = self.state();
        if !state.status.is_pending() {
            return false;
        }
        self.transition(&mut state, SequenceStatus::Aborted(reason));
        drop(state);
        trace!(sequence_id = %self.id, reason = %reason, "sequence aborted");
        metrics::counter!("bridge_sequences_aborted", "reason" => reason.as_str()).increment(1);
        true
    }

    /// Resolves once the sequence leaves the pending state.
    pub async fn wait(&self) -> SequenceStatus {
        let mut rx = self.status_tx.subscribe();
        let outcome = rx.wait_for(|status| !status.is_pending()).await.map(|s| *s);
        outcome.unwrap_or_else(|_| *rx.borrow())
    }

    fn transition(&self, state: &mut SequenceState, status: SequenceStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("members", &state.members.len())
            .field("status", &state.status)
            .finish()
    }
}
