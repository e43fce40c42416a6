//! Consumers: one receive loop per binding, batches handled one at a time.
//!
//! A consumer pulls raw batches from a [`ReceiveTransport`], runs each batch
//! through its behavior pipeline into a [`BatchHandler`], then commits the
//! batch offsets or gives them back. Each connect opens a fresh session with
//! its own [`SequenceStore`]; disconnecting disposes it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bridge_idempotency::DedupKey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::chunk::ChunkReassembler;
use crate::endpoint::ConsumerEndpoint;
use crate::envelope::{Envelope, Offset, RawMessage};
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::{self, SharedBehavior, Terminal};
use crate::sequence::SequenceStore;
use crate::transport::{SharedAckTransport, SharedReceiveTransport};

/// Delay before asking a failing source again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// State carried through the inbound pipeline for one batch.
pub struct ConsumerContext<M> {
    pub consumer_id: String,
    pub endpoint: String,
    /// Raw messages as received.
    pub messages: Vec<RawMessage>,
    /// Envelopes handed to the bus.
    pub deliveries: Vec<Envelope<M>>,
    /// Positions committed or given back with the batch.
    pub offsets: Vec<Offset>,
    /// Keys recorded by the deduplication store once the batch commits.
    pub dedup_keys: Vec<DedupKey>,
    pub chunks: Arc<ChunkReassembler>,
}

impl<M> ConsumerContext<M> {
    pub fn new(
        consumer_id: impl Into<String>,
        endpoint: impl Into<String>,
        messages: Vec<RawMessage>,
        chunks: Arc<ChunkReassembler>,
    ) -> Self {
        let offsets = messages.iter().filter_map(|m| m.offset.clone()).collect();
        Self {
            consumer_id: consumer_id.into(),
            endpoint: endpoint.into(),
            messages,
            deliveries: Vec::new(),
            offsets,
            dedup_keys: Vec::new(),
            chunks,
        }
    }
}

/// Terminal step of the inbound pipeline, plus its transaction hooks.
///
/// `handle` may run more than once for the same batch when a stage retries,
/// so it must start from a clean slate every time.
#[async_trait]
pub trait BatchHandler<M: Send + 'static>: Send + Sync {
    async fn handle(&self, context: &mut ConsumerContext<M>) -> BridgeResult<()>;

    async fn commit(&self, _context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        Ok(())
    }

    async fn rollback(&self, _context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        Ok(())
    }
}

pub type SharedBatchHandler<M> = Arc<dyn BatchHandler<M>>;

struct HandlerTerminal<'a, M: Send + Sync + 'static> {
    handler: &'a dyn BatchHandler<M>,
}

#[async_trait]
impl<'a, M: Send + Sync + 'static> Terminal<ConsumerContext<M>> for HandlerTerminal<'a, M> {
    async fn invoke(&self, context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        self.handler.handle(context).await
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A batch that failed, with the offsets still to give back.
struct Rejected {
    error: BridgeError,
    offsets: Vec<Offset>,
}

/// Why the receive loop left a buffer behind. Offsets are those of a batch
/// taken from the buffer but not committed.
enum Halt {
    Stopped(Vec<Offset>),
    /// A batch failed: everything buffered after it goes back too and the
    /// source is read again from the failed batch.
    Rewind(Vec<Offset>),
}

pub struct Consumer<M: Send + Sync + 'static> {
    id: String,
    endpoint: ConsumerEndpoint,
    behaviors: Vec<SharedBehavior<ConsumerContext<M>>>,
    handler: SharedBatchHandler<M>,
    acknowledger: SharedAckTransport,
    session: Mutex<Option<Arc<ChunkReassembler>>>,
    processing: tokio::sync::Mutex<()>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl<M> Consumer<M>
where
    M: Send + Sync + 'static,
{
    pub fn new(
        id: impl Into<String>,
        endpoint: ConsumerEndpoint,
        behaviors: Vec<SharedBehavior<ConsumerContext<M>>>,
        handler: SharedBatchHandler<M>,
        acknowledger: SharedAckTransport,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint,
            behaviors,
            handler,
            acknowledger,
            session: Mutex::new(None),
            processing: tokio::sync::Mutex::new(()),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &ConsumerEndpoint {
        &self.endpoint
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<Arc<ChunkReassembler>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Option<Arc<ChunkReassembler>> {
        self.session_slot().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session_slot().is_some()
    }

    /// Sequence store of the current session.
    pub fn sequences(&self) -> Option<Arc<SequenceStore>> {
        self.session().map(|chunks| chunks.store().clone())
    }

    /// Opens a session. Connecting twice keeps the first session.
    pub fn connect(&self) {
        let mut slot = self.session_slot();
        if slot.is_some() {
            return;
        }
        let store = Arc::new(SequenceStore::new());
        info!(consumer = %self.id, endpoint = %self.endpoint.name, store = %store.id(), "consumer connected");
        *slot = Some(Arc::new(ChunkReassembler::new(store)));
    }

    /// Closes the session, aborting its pending sequences.
    pub fn disconnect(&self) {
        let previous = self.session_slot().take();
        if let Some(chunks) = previous {
            chunks.store().dispose();
            info!(consumer = %self.id, endpoint = %self.endpoint.name, "consumer disconnected");
        }
    }

    /// Runs one batch through the pipeline and commits or rolls it back.
    pub async fn handle_messages(&self, batch: Vec<RawMessage>) -> BridgeResult<()> {
        let chunks = self.session().ok_or_else(|| BridgeError::NotConnected {
            endpoint: self.endpoint.name.clone(),
            consumer: self.id.clone(),
        })?;
        let _processing = self.processing.lock().await;
        match self.process(batch, chunks).await {
            Ok(()) => Ok(()),
            Err(rejected) => {
                self.give_back(&rejected.offsets).await;
                Err(rejected.error)
            }
        }
    }

    /// Pipeline plus commit. A failed batch is rolled back in the handler; its
    /// offsets are left for the caller to give back.
    #[instrument(
        name = "bridge.consume",
        skip_all,
        fields(consumer = %self.id, endpoint = %self.endpoint.name, messages = batch.len())
    )]
    async fn process(&self, batch: Vec<RawMessage>, chunks: Arc<ChunkReassembler>) -> Result<(), Rejected> {
        let mut context = ConsumerContext::new(self.id.clone(), self.endpoint.name.clone(), batch, chunks);
        let terminal = HandlerTerminal {
            handler: self.handler.as_ref(),
        };
        let outcome = match pipeline::execute(&self.behaviors, &mut context, &terminal).await {
            Ok(()) => self.commit(&mut context).await,
            Err(err) => Err(err),
        };
        if let Err(error) = outcome {
            error!(error = %error, code = error.code(), "batch failed, rolling back");
            self.rollback(&mut context).await;
            return Err(Rejected {
                error,
                offsets: context.offsets,
            });
        }
        Ok(())
    }

    async fn commit(&self, context: &mut ConsumerContext<M>) -> BridgeResult<()> {
        self.handler.commit(context).await?;
        if !context.offsets.is_empty() {
            self.acknowledger
                .commit(&self.endpoint.name, &context.offsets)
                .await
                .map_err(BridgeError::Processing)?;
        }
        debug!(
            delivered = context.deliveries.len(),
            offsets = context.offsets.len(),
            "batch committed"
        );
        metrics::counter!("bridge_batches_committed", "endpoint" => self.endpoint.name.clone())
            .increment(1);
        Ok(())
    }

    async fn rollback(&self, context: &mut ConsumerContext<M>) {
        if let Err(err) = self.handler.rollback(context).await {
            warn!(error = %err, "handler rollback failed");
        }
        metrics::counter!("bridge_batches_rolled_back", "endpoint" => self.endpoint.name.clone())
            .increment(1);
    }

    async fn give_back(&self, offsets: &[Offset]) {
        if offsets.is_empty() {
            return;
        }
        if let Err(err) = self.acknowledger.rollback(&self.endpoint.name, offsets).await {
            warn!(consumer = %self.id, error = %err, "failed to give offsets back to the broker");
        }
    }

    /// Connects and spawns the receive loop. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>, source: SharedReceiveTransport) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        self.connect();
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(source, signal));
        *worker = Some(Worker { shutdown, task });
    }

    /// Stops the receive loop, waits for the batch in flight, then disconnects.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(err) = worker.task.await {
                warn!(consumer = %self.id, error = %err, "consumer task ended abnormally");
            }
        }
        self.disconnect();
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    async fn run(self: Arc<Self>, source: SharedReceiveTransport, mut shutdown: watch::Receiver<bool>) {
        debug!(consumer = %self.id, "receive loop started");
        loop {
            let (tx, mut rx) = mpsc::channel(self.endpoint.backpressure_limit.max(1));
            let (stop_pump, pump_signal) = watch::channel(false);
            let pump = tokio::spawn(self.clone().pump(source.clone(), tx, pump_signal));

            let halt = self.consume(&mut rx, &mut shutdown).await;

            // The pump gives back whatever it holds before it returns, so it
            // must finish before the failed batch and the buffer go back.
            let _ = stop_pump.send(true);
            if let Err(err) = pump.await {
                warn!(consumer = %self.id, error = %err, "receive pump ended abnormally");
            }
            rx.close();
            let (mut offsets, rewind) = match halt {
                Halt::Stopped(offsets) => (offsets, false),
                Halt::Rewind(offsets) => (offsets, true),
            };
            while let Ok(batch) = rx.try_recv() {
                offsets.extend(batch.into_iter().filter_map(|m| m.offset));
            }
            self.give_back(&offsets).await;

            if !rewind || *shutdown.borrow() {
                break;
            }
            debug!(consumer = %self.id, offsets = offsets.len(), "rewound to the failed batch");
        }
        debug!(consumer = %self.id, "receive loop stopped");
    }

    /// Handles buffered batches until shutdown, a closed source or a failure.
    async fn consume(&self, rx: &mut mpsc::Receiver<Vec<RawMessage>>, shutdown: &mut watch::Receiver<bool>) -> Halt {
        loop {
            let batch = tokio::select! {
                _ = shutdown.changed() => return Halt::Stopped(Vec::new()),
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => return Halt::Stopped(Vec::new()),
                },
            };
            let Some(chunks) = self.session() else {
                warn!(consumer = %self.id, "session closed under the receive loop");
                return Halt::Stopped(batch.into_iter().filter_map(|m| m.offset).collect());
            };
            let _processing = self.processing.lock().await;
            if let Err(rejected) = self.process(batch, chunks).await {
                warn!(consumer = %self.id, error = %rejected.error, "batch will be redelivered");
                return Halt::Rewind(rejected.offsets);
            }
        }
    }

    /// Moves batches from the source into the bounded buffer.
    async fn pump(
        self: Arc<Self>,
        source: SharedReceiveTransport,
        tx: mpsc::Sender<Vec<RawMessage>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => return,
                received = source.receive(&self.endpoint.name, self.endpoint.batch_size) => received,
            };
            match received {
                Ok(Some(batch)) if batch.is_empty() => continue,
                Ok(Some(batch)) => {
                    let permit = tokio::select! {
                        biased;
                        permit = tx.reserve() => permit.ok(),
                        _ = shutdown.changed() => None,
                    };
                    match permit {
                        Some(permit) => permit.send(batch),
                        None => {
                            let offsets: Vec<Offset> =
                                batch.iter().filter_map(|m| m.offset.clone()).collect();
                            self.give_back(&offsets).await;
                            return;
                        }
                    }
                }
                Ok(None) => {
                    debug!(consumer = %self.id, "source closed");
                    return;
                }
                Err(err) => {
                    warn!(consumer = %self.id, error = %err, "receive failed");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::InMemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        batches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BatchHandler<()> for CountingHandler {
        async fn handle(&self, _context: &mut ConsumerContext<()>) -> BridgeResult<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BridgeError::processing(anyhow::anyhow!("handler failed")));
            }
            Ok(())
        }
    }

    fn consumer(handler: Arc<CountingHandler>, broker: &Arc<InMemoryBroker>) -> Arc<Consumer<()>> {
        Arc::new(Consumer::new(
            "orders-0",
            ConsumerEndpoint::new("orders"),
            Vec::new(),
            handler,
            broker.clone(),
        ))
    }

    fn message(offset: u64) -> RawMessage {
        RawMessage::new("orders", &b"{}"[..]).with_offset(Offset::new("orders", offset.to_string()))
    }

    #[tokio::test]
    async fn rejects_batches_while_disconnected() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = consumer(Arc::default(), &broker);
        let err = consumer.handle_messages(vec![message(0)]).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn commits_offsets_after_a_successful_batch() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = consumer(Arc::default(), &broker);
        consumer.connect();
        consumer
            .handle_messages(vec![message(0), message(1)])
            .await
            .unwrap();
        assert_eq!(
            broker.committed("orders"),
            vec![Offset::new("orders", "0"), Offset::new("orders", "1")]
        );
    }

    #[tokio::test]
    async fn failed_batch_is_given_back() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..Default::default()
        });
        let consumer = consumer(handler, &broker);
        consumer.connect();
        let err = consumer.handle_messages(vec![message(0)]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Processing(_)));
        assert!(broker.committed("orders").is_empty());
        assert_eq!(broker.rollback_count("orders"), 1);
    }

    #[tokio::test]
    async fn disconnect_disposes_the_session_store() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = consumer(Arc::default(), &broker);
        consumer.connect();
        let store = consumer.sequences().unwrap();
        consumer.disconnect();
        assert!(store.is_disposed());
        assert!(!consumer.is_connected());

        consumer.connect();
        let fresh = consumer.sequences().unwrap();
        assert_ne!(fresh.id(), store.id());
    }

    #[tokio::test]
    async fn receive_loop_processes_until_stopped() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer(handler.clone(), &broker);
        consumer.start(broker.clone()).await;
        assert!(consumer.is_running().await);

        for offset in 0..3 {
            broker.push(message(offset));
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.committed("orders").len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        consumer.stop().await;
        assert!(!consumer.is_running().await);
        assert!(!consumer.is_connected());
        assert_eq!(handler.batches.load(Ordering::SeqCst), 3);
    }
}
