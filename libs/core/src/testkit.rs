//! Loopback broker for tests and demos.
//!
//! Everything published to an endpoint becomes receivable from that same
//! endpoint. Offsets are `endpoint@n` with `n` counting from zero per
//! endpoint. Rolled back offsets are put back at the head of the queue.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::envelope::{Offset, RawMessage};
use crate::errors::{BridgeError, BridgeResult};
use crate::transport::{AckTransport, PublishTransport, ReceiveTransport};

#[derive(Default)]
struct BrokerState {
    next_offset: HashMap<String, u64>,
    published: HashMap<String, Vec<RawMessage>>,
    queues: HashMap<String, VecDeque<RawMessage>>,
    log: HashMap<Offset, RawMessage>,
    committed: HashMap<String, Vec<Offset>>,
    rollbacks: HashMap<String, usize>,
    closed: bool,
}

#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    arrivals: Notify,
    failing_publishes: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Queues an inbound message. Messages without an offset get the next one.
    pub fn push(&self, message: RawMessage) -> Offset {
        let offset = {
            let mut state = self.state();
            let offset = match &message.offset {
                Some(offset) => offset.clone(),
                None => next_offset(&mut state, &message.endpoint),
            };
            let message = message.with_offset(offset.clone());
            state.log.insert(offset.clone(), message.clone());
            state
                .queues
                .entry(message.endpoint.clone())
                .or_default()
                .push_back(message);
            offset
        };
        self.arrivals.notify_waiters();
        offset
    }

    /// Receivers drain what is queued, then see the source as closed.
    pub fn close(&self) {
        self.state().closed = true;
        self.arrivals.notify_waiters();
    }

    pub fn published(&self, endpoint: &str) -> Vec<RawMessage> {
        self.state().published.get(endpoint).cloned().unwrap_or_default()
    }

    pub fn committed(&self, endpoint: &str) -> Vec<Offset> {
        self.state().committed.get(endpoint).cloned().unwrap_or_default()
    }

    pub fn rollback_count(&self, endpoint: &str) -> usize {
        self.state().rollbacks.get(endpoint).copied().unwrap_or_default()
    }

    /// Messages received or queued but not yet committed.
    pub fn uncommitted(&self) -> usize {
        self.state().log.len()
    }

    /// Messages waiting to be received.
    pub fn queued(&self, endpoint: &str) -> usize {
        self.state().queues.get(endpoint).map_or(0, VecDeque::len)
    }

    fn publish_raw(&self, message: &RawMessage) -> BridgeResult<Option<Offset>> {
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::publish(
                message.endpoint.clone(),
                anyhow::anyhow!("broker unavailable"),
            ));
        }
        let offset = {
            let mut state = self.state();
            let offset = next_offset(&mut state, &message.endpoint);
            let stored = message.clone().with_offset(offset.clone());
            state
                .published
                .entry(message.endpoint.clone())
                .or_default()
                .push(stored.clone());
            state.log.insert(offset.clone(), stored.clone());
            state
                .queues
                .entry(message.endpoint.clone())
                .or_default()
                .push_back(stored);
            offset
        };
        self.arrivals.notify_waiters();
        Ok(Some(offset))
    }
}

fn next_offset(state: &mut BrokerState, endpoint: &str) -> Offset {
    let counter = state.next_offset.entry(endpoint.to_string()).or_default();
    let offset = Offset::new(endpoint, counter.to_string());
    *counter += 1;
    offset
}

#[async_trait]
impl PublishTransport for InMemoryBroker {
    fn publish(&self, message: &RawMessage) -> BridgeResult<Option<Offset>> {
        self.publish_raw(message)
    }

    async fn publish_async(&self, message: &RawMessage) -> BridgeResult<Option<Offset>> {
        self.publish_raw(message)
    }
}

#[async_trait]
impl ReceiveTransport for InMemoryBroker {
    async fn receive(&self, endpoint: &str, max: usize) -> anyhow::Result<Option<Vec<RawMessage>>> {
        loop {
            let mut arrival = pin!(self.arrivals.notified());
            arrival.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(queue) = state.queues.get_mut(endpoint) {
                    if !queue.is_empty() {
                        let take = max.max(1).min(queue.len());
                        return Ok(Some(queue.drain(..take).collect()));
                    }
                }
                if state.closed {
                    return Ok(None);
                }
            }
            arrival.await;
        }
    }
}

#[async_trait]
impl AckTransport for InMemoryBroker {
    async fn commit(&self, endpoint: &str, offsets: &[Offset]) -> anyhow::Result<()> {
        let mut state = self.state();
        for offset in offsets {
            state.log.remove(offset);
        }
        state
            .committed
            .entry(endpoint.to_string())
            .or_default()
            .extend(offsets.iter().cloned());
        Ok(())
    }

    async fn rollback(&self, endpoint: &str, offsets: &[Offset]) -> anyhow::Result<()> {
        {
            let mut state = self.state();
            *state.rollbacks.entry(endpoint.to_string()).or_default() += 1;
            let redelivered: Vec<RawMessage> = offsets
                .iter()
                .filter_map(|offset| state.log.get(offset).cloned())
                .collect();
            let queue = state.queues.entry(endpoint.to_string()).or_default();
            for message in redelivered.into_iter().rev() {
                queue.push_front(message);
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_messages_loop_back_in_order() {
        let broker = InMemoryBroker::new();
        for payload in ["a", "b", "c"] {
            broker
                .publish_async(&RawMessage::new("orders", payload.as_bytes()))
                .await
                .unwrap();
        }
        let batch = broker.receive("orders", 2).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, Some(Offset::new("orders", "0")));
        assert_eq!(broker.queued("orders"), 1);
    }

    #[tokio::test]
    async fn rollback_redelivers_at_the_head() {
        let broker = InMemoryBroker::new();
        for payload in ["a", "b"] {
            broker.push(RawMessage::new("orders", payload.as_bytes()));
        }
        let first = broker.receive("orders", 1).await.unwrap().unwrap();
        broker
            .rollback("orders", &[first[0].offset.clone().unwrap()])
            .await
            .unwrap();
        let again = broker.receive("orders", 1).await.unwrap().unwrap();
        assert_eq!(again[0].payload, "a");
        assert_eq!(broker.rollback_count("orders"), 1);
    }

    #[tokio::test]
    async fn receive_waits_for_arrivals_and_ends_on_close() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("orders", 10).await })
        };
        tokio::task::yield_now().await;
        broker.push(RawMessage::new("orders", &b"x"[..]));
        let batch = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(batch.len(), 1);

        broker.close();
        assert!(broker.receive("orders", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_messages_leave_the_redelivery_log() {
        let broker = InMemoryBroker::new();
        for payload in ["a", "b", "c"] {
            broker.push(RawMessage::new("orders", payload.as_bytes()));
        }
        let batch = broker.receive("orders", 2).await.unwrap().unwrap();
        let offsets: Vec<Offset> = batch.iter().filter_map(|m| m.offset.clone()).collect();
        assert_eq!(broker.uncommitted(), 3);

        broker.commit("orders", &offsets).await.unwrap();
        assert_eq!(broker.uncommitted(), 1);
        assert_eq!(broker.committed("orders"), offsets);

        broker.rollback("orders", &offsets).await.unwrap();
        assert_eq!(broker.queued("orders"), 1);
    }

    #[test]
    fn failing_publishes_recover() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        let message = RawMessage::new("orders", &b"x"[..]);
        assert!(broker.publish(&message).is_err());
        assert!(broker.publish(&message).unwrap().is_some());
    }
}
