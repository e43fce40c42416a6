use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bridge_core::{
    Behavior, BridgeError, BridgeResult, InMemoryOutbox, JsonCodec, MESSAGE_ID_HEADER,
    MessageHeaders, MessageIdBehavior, Next, OutboundQueueProducer, OutboundRouter, Producer,
    ProducerContext, ProducerEndpoint, RetryBehavior, TransactionalOutbox,
    testkit::InMemoryBroker,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: u64,
    region: String,
}

fn order(id: u64, region: &str) -> OrderPlaced {
    OrderPlaced {
        id,
        region: region.to_string(),
    }
}

fn producer(broker: &Arc<InMemoryBroker>, endpoint: &str) -> Producer<OrderPlaced> {
    Producer::new(
        ProducerEndpoint::new(endpoint),
        Arc::new(JsonCodec::<OrderPlaced>::new()),
        broker.clone(),
    )
    .unwrap()
}

/// Records the headers each envelope had when it reached the stage.
#[derive(Default)]
struct HeaderProbe {
    seen: Mutex<Vec<MessageHeaders>>,
}

#[async_trait]
impl Behavior<ProducerContext<OrderPlaced>> for HeaderProbe {
    async fn handle(
        &self,
        context: &mut ProducerContext<OrderPlaced>,
        next: Next<'_, ProducerContext<OrderPlaced>>,
    ) -> BridgeResult<()> {
        let region = context
            .envelope
            .message
            .as_ref()
            .map(|m| m.region.clone())
            .unwrap_or_default();
        context.envelope.headers.add("x-region", region);
        self.seen.lock().unwrap().push(context.envelope.headers.clone());
        next.run(context).await
    }
}

#[tokio::test]
async fn five_messages_without_stages_get_distinct_offsets() {
    let broker = Arc::new(InMemoryBroker::new());
    let producer = producer(&broker, "orders");

    let mut offsets = HashSet::new();
    for id in 0..5 {
        let offset = producer
            .produce_async(order(id, "eu"), MessageHeaders::new())
            .await
            .unwrap()
            .expect("broker assigns an offset");
        offsets.insert(offset);
    }
    assert_eq!(offsets.len(), 5);
    assert_eq!(broker.published("orders").len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_produce_calls_do_not_share_headers() {
    let broker = Arc::new(InMemoryBroker::new());
    let probe = Arc::new(HeaderProbe::default());
    let producer = Arc::new(producer(&broker, "orders").with_behavior(probe.clone()));
    let shared = MessageHeaders::from_iter([("x-tenant", "acme")]);

    let tasks: Vec<_> = ["eu", "us"]
        .into_iter()
        .enumerate()
        .map(|(id, region)| {
            let producer = producer.clone();
            let headers = shared.clone();
            tokio::spawn(async move {
                producer
                    .produce_async(order(id as u64, region), headers)
                    .await
            })
        })
        .collect();

    let mut offsets = HashSet::new();
    for task in tasks {
        offsets.insert(task.await.unwrap().unwrap().unwrap());
    }
    assert_eq!(offsets.len(), 2);
    assert_eq!(shared.len(), 1, "caller headers stay untouched");

    for message in broker.published("orders") {
        let body: OrderPlaced = serde_json::from_slice(&message.payload).unwrap();
        let regions: Vec<_> = message.headers.get_all("x-region").collect();
        assert_eq!(regions, vec![body.region.as_str()]);
    }
    assert_eq!(probe.seen.lock().unwrap().len(), 2);
}

#[test]
fn blocking_produce_stamps_message_ids() {
    let broker = Arc::new(InMemoryBroker::new());
    let producer = producer(&broker, "orders").with_behavior(Arc::new(MessageIdBehavior));
    producer.produce(order(1, "eu"), MessageHeaders::new()).unwrap();
    producer
        .produce(
            order(2, "eu"),
            MessageHeaders::from_iter([(MESSAGE_ID_HEADER, "fixed-id")]),
        )
        .unwrap();

    let published = broker.published("orders");
    let generated = published[0].message_id().unwrap();
    assert!(uuid::Uuid::parse_str(generated).is_ok());
    assert_eq!(published[1].message_id(), Some("fixed-id"));
}

#[tokio::test]
async fn publish_failures_surface_without_retry_stage() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next_publishes(1);
    let err = producer(&broker, "orders")
        .produce_async(order(1, "eu"), MessageHeaders::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Publish { ref endpoint, .. } if endpoint == "orders"));
    assert!(broker.published("orders").is_empty());
}

#[tokio::test]
async fn retry_stage_recovers_from_transient_publish_failures() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next_publishes(2);
    let producer = producer(&broker, "orders")
        .with_behavior(Arc::new(RetryBehavior::new(3, Duration::from_millis(1))));
    let offset = producer
        .produce_async(order(1, "eu"), MessageHeaders::new())
        .await
        .unwrap();
    assert!(offset.is_some());
    assert_eq!(broker.published("orders").len(), 1);
}

#[tokio::test]
async fn outbound_queue_enqueues_exactly_one_entry() {
    let outbox = InMemoryOutbox::new();
    let producer = OutboundQueueProducer::new(
        ProducerEndpoint::new("orders"),
        Arc::new(JsonCodec::<OrderPlaced>::new()),
        Arc::new(outbox.clone()),
    )
    .unwrap();

    let offset = producer
        .produce_async(order(9, "eu"), MessageHeaders::new())
        .await
        .unwrap();
    assert!(offset.is_none());
    assert_eq!(outbox.len(), 1);

    let err = producer
        .produce(order(10, "eu"), MessageHeaders::new())
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedOperation(_)));
    assert_eq!(outbox.len(), 1);

    let entry = outbox.dequeue(1).remove(0);
    let relayed: OrderPlaced = serde_json::from_slice(&entry.to_raw().payload).unwrap();
    assert_eq!(relayed, order(9, "eu"));
}

#[tokio::test]
async fn deferred_outbox_entries_follow_the_unit_of_work() {
    let outbox = InMemoryOutbox::new();
    let tx = Arc::new(TransactionalOutbox::new(Arc::new(outbox.clone())));
    let producer = OutboundQueueProducer::new(
        ProducerEndpoint::new("orders"),
        Arc::new(JsonCodec::<OrderPlaced>::new()),
        tx.clone(),
    )
    .unwrap();

    producer
        .produce_async(order(1, "eu"), MessageHeaders::new())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(outbox.len(), 1);

    producer
        .produce_async(order(2, "eu"), MessageHeaders::new())
        .await
        .unwrap();
    tx.rollback();
    assert_eq!(outbox.len(), 1);
}

#[tokio::test]
async fn router_fans_out_to_matching_endpoints() {
    let broker = Arc::new(InMemoryBroker::new());
    let router = OutboundRouter::new()
        .route(
            |m: &OrderPlaced| m.region == "eu",
            Arc::new(producer(&broker, "test1")),
        )
        .route(|_: &OrderPlaced| true, Arc::new(producer(&broker, "test2")));

    let regions = ["eu", "us", "us", "eu", "apac"];
    for (id, region) in regions.into_iter().enumerate() {
        router
            .publish(order(id as u64, region), MessageHeaders::new())
            .await
            .unwrap();
    }

    assert_eq!(broker.published("test1").len(), 2);
    assert_eq!(broker.published("test2").len(), 5);
    assert_eq!(
        broker.published("test1").len() + broker.published("test2").len(),
        7
    );
}
