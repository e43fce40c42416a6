//! Inbound connector: binds consumers to an endpoint and relays what they
//! receive onto the in-process bus.
//!
//! Per batch the relay joins chunks, skips duplicates, deserializes the rest
//! and publishes the resulting envelopes as one batch. Chunk groups and
//! deduplication keys are only made durable when the batch commits.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_bus::SharedBusRelay;
use bridge_idempotency::{DedupGuard, DedupKey, SharedDedupStore};
use tracing::{debug, info, warn};

use crate::chunk::ChunkHeader;
use crate::codec::SharedCodec;
use crate::consumer::{BatchHandler, Consumer, ConsumerContext};
use crate::endpoint::ConsumerEndpoint;
use crate::envelope::{Envelope, RawMessage};
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::SharedBehavior;
use crate::transport::{SharedAckTransport, SharedReceiveTransport};

/// How inbound duplicates are recognised.
#[derive(Clone, Default)]
pub enum DedupPolicy {
    #[default]
    Disabled,
    /// Skip messages whose `x-message-id` was already processed.
    MessageId(DedupGuard),
    /// Skip messages whose partition position was already committed.
    Offset(DedupGuard),
}

impl DedupPolicy {
    pub fn message_id(store: SharedDedupStore) -> Self {
        Self::MessageId(DedupGuard::new(store))
    }

    pub fn offset(store: SharedDedupStore) -> Self {
        Self::Offset(DedupGuard::new(store))
    }

    fn guard(&self) -> Option<&DedupGuard> {
        match self {
            Self::Disabled => None,
            Self::MessageId(guard) | Self::Offset(guard) => Some(guard),
        }
    }

    /// Messages lacking the identity the policy needs are never deduplicated.
    fn key_for(&self, message: &RawMessage) -> Option<DedupKey> {
        match self {
            Self::Disabled => None,
            Self::MessageId(_) => message
                .message_id()
                .map(|id| DedupKey::message(&message.endpoint, id)),
            Self::Offset(_) => message
                .offset
                .as_ref()
                .map(|offset| DedupKey::offset(&message.endpoint, &offset.key, &offset.value)),
        }
    }
}

struct RelayHandler<M: Send + Sync + 'static> {
    bus: SharedBusRelay<Envelope<M>>,
    codec: SharedCodec<M>,
    dedup: DedupPolicy,
}

impl<M: Send + Sync + 'static> RelayHandler<M> {
    /// `Ok(true)` when the message must be skipped.
    async fn is_duplicate(&self, key: &DedupKey, batch_keys: &mut HashSet<DedupKey>) -> BridgeResult<bool> {
        if !batch_keys.insert(key.clone()) {
            warn!(key = %key, "duplicate message skipped within batch");
            metrics::counter!("bridge_duplicates_skipped", "endpoint" => key.endpoint().to_string())
                .increment(1);
            return Ok(true);
        }
        match self.dedup.guard() {
            Some(guard) => guard.is_duplicate(key).await.map_err(BridgeError::Processing),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> BatchHandler<M> for RelayHandler<M> {
    async fn handle(&self, context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        // A retried attempt must not see chunks or keys of the failed one.
        context.chunks.rollback();
        context.deliveries.clear();
        context.dedup_keys.clear();

        let mut batch_keys = HashSet::new();
        for raw in &context.messages {
            let message = if ChunkHeader::is_chunk(&raw.headers) {
                match context.chunks.join_if_complete(raw)? {
                    Some(joined) => joined,
                    None => continue,
                }
            } else {
                raw.clone()
            };

            if let Some(key) = self.dedup.key_for(&message) {
                if self.is_duplicate(&key, &mut batch_keys).await? {
                    continue;
                }
                context.dedup_keys.push(key);
            }

            let decoded = self
                .codec
                .deserialize(&message.payload, &message.headers)
                .map_err(BridgeError::Processing)?;
            let mut envelope = Envelope::inbound(message);
            envelope.message = Some(decoded);
            context.deliveries.push(envelope);
        }

        if context.deliveries.is_empty() {
            debug!(consumer = %context.consumer_id, "nothing to relay");
            return Ok(());
        }
        self.bus
            .publish(&context.deliveries)
            .await
            .map_err(BridgeError::processing)?;
        debug!(consumer = %context.consumer_id, delivered = context.deliveries.len(), "batch relayed");
        Ok(())
    }

    async fn commit(&self, context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        context.chunks.commit();
        if let Some(guard) = self.dedup.guard() {
            for key in context.dedup_keys.drain(..) {
                guard.record(key).await.map_err(BridgeError::Processing)?;
            }
        }
        Ok(())
    }

    async fn rollback(&self, context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        context.chunks.rollback();
        context.dedup_keys.clear();
        Ok(())
    }
}

/// Binds consumers to endpoints and relays their batches to the bus.
pub struct InboundConnector<M: Send + Sync + 'static> {
    bus: SharedBusRelay<Envelope<M>>,
    codec: SharedCodec<M>,
    dedup: DedupPolicy,
    behaviors: Vec<SharedBehavior<ConsumerContext<M>>>,
    consumers: Vec<Arc<Consumer<M>>>,
}

impl<M> InboundConnector<M>
where
    M: Send + Sync + 'static,
{
    pub fn new(bus: SharedBusRelay<Envelope<M>>, codec: SharedCodec<M>) -> Self {
        Self {
            bus,
            codec,
            dedup: DedupPolicy::Disabled,
            behaviors: Vec::new(),
            consumers: Vec::new(),
        }
    }

    /// Applies to endpoints bound afterwards.
    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }

    /// Applies to endpoints bound afterwards.
    pub fn with_behavior(mut self, behavior: SharedBehavior<ConsumerContext<M>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Validates `endpoint` and creates its consumers, one per configured slot.
    pub fn bind(
        &mut self,
        endpoint: ConsumerEndpoint,
        acknowledger: SharedAckTransport,
    ) -> BridgeResult<Vec<Arc<Consumer<M>>>> {
        endpoint.validate()?;
        let handler = Arc::new(RelayHandler {
            bus: self.bus.clone(),
            codec: self.codec.clone(),
            dedup: self.dedup.clone(),
        });
        let bound: Vec<Arc<Consumer<M>>> = (0..endpoint.consumers)
            .map(|slot| {
                Arc::new(Consumer::new(
                    format!("{}-{slot}", endpoint.name),
                    endpoint.clone(),
                    self.behaviors.clone(),
                    handler.clone(),
                    acknowledger.clone(),
                ))
            })
            .collect();
        info!(
            endpoint = %endpoint.name,
            consumers = endpoint.consumers,
            batch_size = endpoint.batch_size,
            "endpoint bound"
        );
        self.consumers.extend(bound.iter().cloned());
        Ok(bound)
    }

    pub fn consumers(&self) -> &[Arc<Consumer<M>>] {
        &self.consumers
    }

    /// Starts the receive loop of every bound consumer.
    pub async fn connect(&self, source: SharedReceiveTransport) {
        for consumer in &self.consumers {
            consumer.start(source.clone()).await;
        }
    }

    /// Stops every receive loop and closes the consumer sessions.
    pub async fn disconnect(&self) {
        for consumer in &self.consumers {
            consumer.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::testkit::InMemoryBroker;
    use bridge_bus::{InMemoryBus, RecordingSubscriber};

    fn connector(bus: Arc<InMemoryBus<Envelope<u32>>>) -> InboundConnector<u32> {
        InboundConnector::new(bus, Arc::new(JsonCodec::<u32>::new()))
    }

    #[test]
    fn bind_creates_one_consumer_per_slot() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut connector = connector(Arc::new(InMemoryBus::new()));
        let bound = connector
            .bind(ConsumerEndpoint::new("orders").with_consumers(3), broker)
            .unwrap();
        let ids: Vec<_> = bound.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["orders-0", "orders-1", "orders-2"]);
        assert_eq!(connector.consumers().len(), 3);
    }

    #[test]
    fn bind_rejects_invalid_endpoints() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut connector = connector(Arc::new(InMemoryBus::new()));
        let err = connector
            .bind(ConsumerEndpoint::new("orders").with_batch_size(0), broker)
            .err().unwrap();
        assert!(matches!(err, BridgeError::Validation { .. }));
        assert!(connector.consumers().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_publishes_nothing() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus: Arc<InMemoryBus<Envelope<u32>>> = Arc::new(InMemoryBus::new());
        let subscriber = RecordingSubscriber::<Envelope<u32>>::new("app");
        bus.subscribe(Arc::new(subscriber.clone()));
        let mut connector = connector(bus);
        let consumer = connector
            .bind(ConsumerEndpoint::new("orders"), broker)
            .unwrap()
            .remove(0);
        consumer.connect();
        consumer.handle_messages(Vec::new()).await.unwrap();
        assert_eq!(subscriber.count().await, 0);
    }

    #[tokio::test]
    async fn undecodable_payload_fails_the_batch() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut connector = connector(Arc::new(InMemoryBus::new()));
        let consumer = connector
            .bind(ConsumerEndpoint::new("orders"), broker.clone())
            .unwrap()
            .remove(0);
        consumer.connect();
        let err = consumer
            .handle_messages(vec![RawMessage::new("orders", &b"not json"[..])
                .with_offset(crate::envelope::Offset::new("orders", "0"))])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Processing(_)));
        assert_eq!(broker.rollback_count("orders"), 1);
    }
}
