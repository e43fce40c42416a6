use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bridge_bus::{InMemoryBus, RecordingSubscriber};
use bridge_core::{
    BridgeConfig, ChunkingTransport, DedupMode, DedupPolicy, Envelope, InMemoryOutbox,
    InboundConnector, JsonCodec, MessageHeaders, MessageIdBehavior, OutboundQueueProducer,
    Producer, PublishTransport, RetryBehavior, SharedPublishTransport, testkit::InMemoryBroker,
};
use bridge_idempotency::{DedupConfig, InMemoryOffsetStore};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Broker bridge loopback demo")]
struct Cli {
    /// Number of messages to produce
    #[arg(long, default_value_t = 10)]
    messages: usize,
    /// Size of the note attached to each message, to exercise chunking
    #[arg(long, default_value_t = 0)]
    note_bytes: usize,
    /// Produce into the outbound queue and relay it to the broker afterwards
    #[arg(long)]
    via_outbox: bool,
    /// Give up waiting for deliveries after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    /// Emit the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    note: String,
}

#[derive(Serialize)]
struct Summary {
    endpoint: String,
    produced: usize,
    received: usize,
    committed: usize,
    rollbacks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    bridge_telemetry::install("bridge-loopback")?;
    let cli = Cli::parse();
    let config = BridgeConfig::from_env();

    let broker = Arc::new(InMemoryBroker::new());
    let publish: SharedPublishTransport = match config.chunk_size {
        Some(chunk_size) => Arc::new(ChunkingTransport::new(broker.clone(), chunk_size)),
        None => broker.clone(),
    };
    let producer = Producer::new(
        config.producer.clone(),
        Arc::new(JsonCodec::<OrderPlaced>::new()),
        publish.clone(),
    )?
        .with_behavior(Arc::new(MessageIdBehavior))
        .with_behavior(Arc::new(RetryBehavior::new(
            config.retry.max_retries,
            config.retry.backoff,
        )));

    let bus: Arc<InMemoryBus<Envelope<OrderPlaced>>> = Arc::new(InMemoryBus::new());
    let recorder = Arc::new(RecordingSubscriber::<Envelope<OrderPlaced>>::new("loopback"));
    bus.subscribe(recorder.clone());
    let dedup = match config.dedup {
        DedupMode::Disabled => DedupPolicy::Disabled,
        DedupMode::MessageId => {
            DedupPolicy::message_id(Arc::new(DedupConfig::from_env().inbound_log()))
        }
        DedupMode::Offset => DedupPolicy::offset(Arc::new(InMemoryOffsetStore::new())),
    };
    let mut connector =
        InboundConnector::new(bus, Arc::new(JsonCodec::<OrderPlaced>::new())).with_dedup(dedup);
    connector.bind(config.consumer.clone(), broker.clone())?;
    connector.connect(broker.clone()).await;

    let orders = (0..cli.messages as u64).map(|order_id| OrderPlaced {
        order_id,
        note: "x".repeat(cli.note_bytes),
    });
    if cli.via_outbox {
        let outbox = InMemoryOutbox::new();
        let queued = OutboundQueueProducer::new(
            config.producer.clone(),
            Arc::new(JsonCodec::<OrderPlaced>::new()),
            Arc::new(outbox.clone()),
        )?
        .with_behavior(Arc::new(MessageIdBehavior));
        for order in orders {
            queued.produce_async(order, MessageHeaders::new()).await?;
        }
        relay_outbox(&outbox, publish.as_ref()).await?;
    } else {
        for order in orders {
            producer.produce_async(order, MessageHeaders::new()).await?;
        }
    }
    info!(messages = cli.messages, endpoint = %config.producer.name, "messages produced");

    let waited = tokio::time::timeout(Duration::from_secs(cli.timeout_secs), async {
        while recorder.count().await < cli.messages {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    connector.disconnect().await;
    broker.close();

    let summary = Summary {
        endpoint: config.consumer.name.clone(),
        produced: cli.messages,
        received: recorder.count().await,
        committed: broker.committed(&config.consumer.name).len(),
        rollbacks: broker.rollback_count(&config.consumer.name),
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            produced = summary.produced,
            received = summary.received,
            committed = summary.committed,
            rollbacks = summary.rollbacks,
            "loopback finished"
        );
    }
    if waited.is_err() {
        bail!(
            "received {} of {} messages before timing out",
            summary.received,
            summary.produced
        );
    }
    Ok(())
}

/// Drains the outbound queue into the broker, oldest entry first.
async fn relay_outbox(outbox: &InMemoryOutbox, transport: &dyn PublishTransport) -> Result<()> {
    loop {
        let entries = outbox.dequeue(32);
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            transport
                .publish_async(&entry.to_raw())
                .await
                .with_context(|| format!("relaying outbox entry {}", entry.id))?;
        }
    }
}
