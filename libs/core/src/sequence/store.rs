use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;
use uuid::Uuid;

use super::{AbortReason, Sequence, SequenceError, SequenceKindTag};

/// Keeps the in-flight sequences of one consumer session.
///
/// Lookups never create sequences. Adding a sequence whose identifier is
/// already taken aborts the pending occupant before the new one becomes
/// visible, under the same shard lock.
pub struct SequenceStore {
    id: Uuid,
    sequences: DashMap<String, Arc<Sequence>>,
    disposed: AtomicBool,
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceStore {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            sequences: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Store identifier, carried in trace logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Looks up a sequence by exact identifier or, with `match_prefix`, by the
    /// first identifier starting with `id`. Which one wins among several
    /// prefix matches is unspecified. The returned sequence is no longer new.
    pub fn get(&self, id: &str, match_prefix: bool) -> Option<Arc<Sequence>> {
        let found = if match_prefix {
            self.sequences
                .iter()
                .find(|entry| entry.key().starts_with(id))
                .map(|entry| entry.value().clone())
        } else {
            self.sequences.get(id).map(|entry| entry.value().clone())
        };
        if let Some(sequence) = &found {
            sequence.set_is_new(false);
        }
        found
    }

    /// Like [`get`](Self::get), but only returns sequences of the requested kind.
    pub fn get_kind(&self, id: &str, match_prefix: bool, kind: SequenceKindTag) -> Option<Arc<Sequence>> {
        let found = if match_prefix {
            self.sequences
                .iter()
                .find(|entry| entry.key().starts_with(id) && entry.value().kind().tag() == kind)
                .map(|entry| entry.value().clone())
        } else {
            self.sequences
                .get(id)
                .filter(|entry| entry.value().kind().tag() == kind)
                .map(|entry| entry.value().clone())
        };
        if let Some(sequence) = &found {
            sequence.set_is_new(false);
        }
        found
    }

    /// Registers `sequence`, aborting a pending one under the same identifier.
    pub fn add(&self, sequence: Sequence) -> Result<Arc<Sequence>, SequenceError> {
        if self.is_disposed() {
            return Err(SequenceError::StoreDisposed {
                store: self.id.to_string(),
            });
        }
        let sequence = Arc::new(sequence);
        match self.sequences.entry(sequence.id().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().abort(AbortReason::IncompleteSequence) {
                    trace!(
                        store = %self.id,
                        sequence_id = %sequence.id(),
                        "pending sequence superseded"
                    );
                }
                occupied.insert(sequence.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(sequence.clone());
            }
        }
        trace!(store = %self.id, sequence_id = %sequence.id(), kind = ?sequence.kind(), "sequence added");
        Ok(sequence)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Sequence>> {
        let removed = self.sequences.remove(id).map(|(_, sequence)| sequence);
        if removed.is_some() {
            trace!(store = %self.id, sequence_id = %id, "sequence removed");
        }
        removed
    }

    /// Removes `sequence` only if it is still the one registered under its id.
    pub fn remove_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let removed = self
            .sequences
            .remove_if(sequence.id(), |_, current| Arc::ptr_eq(current, sequence))
            .is_some();
        if removed {
            trace!(store = %self.id, sequence_id = %sequence.id(), "sequence removed");
        }
        removed
    }

    /// Removes and aborts the sequence. Returns `false` when it was not pending.
    pub fn abort(&self, id: &str, reason: AbortReason) -> bool {
        match self.remove(id) {
            Some(sequence) => sequence.abort(reason),
            None => false,
        }
    }

    /// Pending sequences; unbounded ones only when asked for.
    pub fn pending_sequences(&self, include_unbounded: bool) -> Vec<Arc<Sequence>> {
        self.sequences
            .iter()
            .filter(|entry| entry.value().is_pending())
            .filter(|entry| include_unbounded || entry.value().kind().tag() != SequenceKindTag::Unbounded)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Aborts every pending sequence and empties the store. Runs once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(store = %self.id, pending = self.sequences.len(), "disposing sequence store");
        let keys: Vec<String> = self.sequences.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, sequence)) = self.sequences.remove(&key) {
                sequence.abort(AbortReason::Disposing);
            }
        }
        trace!(store = %self.id, "sequence store disposed");
    }
}

impl Drop for SequenceStore {
    fn drop(&mut self) {
        self.dispose();
    }
}
