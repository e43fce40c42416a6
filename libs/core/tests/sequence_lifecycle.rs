use std::{sync::Arc, time::Duration};

use bridge_core::{
    AbortReason, RawMessage, Sequence, SequenceError, SequenceKindTag, SequenceStatus,
    SequenceStore,
};

fn member(payload: &'static str) -> RawMessage {
    RawMessage::new("orders", payload.as_bytes())
}

#[tokio::test]
async fn waiters_observe_completion_from_another_task() {
    let store = Arc::new(SequenceStore::new());
    let sequence = store.add(Sequence::chunk("group", 2)).unwrap();

    let waiter = {
        let sequence = sequence.clone();
        tokio::spawn(async move { sequence.wait().await })
    };
    sequence.add_member(1, member("b")).unwrap();
    sequence.add_member(0, member("a")).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, SequenceStatus::Complete);
    let payloads: Vec<_> = sequence.members().into_iter().map(|m| m.payload).collect();
    assert_eq!(payloads, vec!["a", "b"]);
}

#[tokio::test]
async fn waiters_observe_aborts() {
    let store = SequenceStore::new();
    let sequence = store.add(Sequence::unbounded("stream")).unwrap();
    let waiter = {
        let sequence = sequence.clone();
        tokio::spawn(async move { sequence.wait().await })
    };
    assert!(store.abort("stream", AbortReason::EnumerationAborted));
    assert_eq!(
        waiter.await.unwrap(),
        SequenceStatus::Aborted(AbortReason::EnumerationAborted)
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn replacing_a_pending_sequence_aborts_it_and_logs_the_store() {
    let store = SequenceStore::new();
    let first = store.add(Sequence::chunk("group", 3)).unwrap();
    first.add_member(0, member("a")).unwrap();

    let second = store.add(Sequence::chunk("group", 3)).unwrap();
    assert_eq!(first.abort_reason(), Some(AbortReason::IncompleteSequence));
    assert!(second.is_pending());
    assert!(Arc::ptr_eq(&store.get("group", false).unwrap(), &second));

    store.dispose();
    assert_eq!(second.abort_reason(), Some(AbortReason::Disposing));
    assert!(logs_contain(&store.id().to_string()));
    assert!(logs_contain("sequence aborted"));
}

#[test]
fn prefix_lookups_respect_kind() {
    let store = SequenceStore::new();
    store.add(Sequence::batch("order-1/batch", 2)).unwrap();
    let chunk = store.add(Sequence::chunk("order-1/chunk", 2)).unwrap();

    let found = store
        .get_kind("order-1", true, SequenceKindTag::Chunk)
        .unwrap();
    assert!(Arc::ptr_eq(&found, &chunk));
    assert!(!found.is_new());
    assert!(store.get_kind("order-2", true, SequenceKindTag::Chunk).is_none());
}

#[test]
fn disposed_store_refuses_new_sequences() {
    let store = SequenceStore::new();
    store.dispose();
    assert!(matches!(
        store.add(Sequence::batch("late", 1)),
        Err(SequenceError::StoreDisposed { .. })
    ));
}
