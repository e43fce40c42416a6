use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tracing::{debug, info, instrument};

use crate::codec::SharedCodec;
use crate::endpoint::ProducerEndpoint;
use crate::envelope::{Envelope, Offset, RawMessage};
use crate::errors::{BridgeError, BridgeResult};
use crate::headers::MessageHeaders;
use crate::pipeline::{self, SharedBehavior, Terminal};
use crate::transport::SharedPublishTransport;

/// State carried through the outbound pipeline.
#[derive(Debug)]
pub struct ProducerContext<M> {
    pub envelope: Envelope<M>,
    /// Set once the transport accepted the envelope.
    pub published: bool,
}

impl<M> ProducerContext<M> {
    pub fn new(envelope: Envelope<M>) -> Self {
        Self {
            envelope,
            published: false,
        }
    }
}

/// Publishes messages to one endpoint through a behavior pipeline.
pub struct Producer<M: Send + Sync + 'static> {
    endpoint: ProducerEndpoint,
    behaviors: Vec<SharedBehavior<ProducerContext<M>>>,
    codec: SharedCodec<M>,
    transport: SharedPublishTransport,
}

impl<M> Producer<M>
where
    M: Send + Sync + 'static,
{
    pub fn new(
        endpoint: ProducerEndpoint,
        codec: SharedCodec<M>,
        transport: SharedPublishTransport,
    ) -> BridgeResult<Self> {
        endpoint.validate()?;
        Ok(Self {
            endpoint,
            behaviors: Vec::new(),
            codec,
            transport,
        })
    }

    /// Appends a stage; stages run in the order they were added.
    pub fn with_behavior(mut self, behavior: SharedBehavior<ProducerContext<M>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    pub fn endpoint(&self) -> &ProducerEndpoint {
        &self.endpoint
    }

    /// Publishes `message`, blocking the calling thread until the broker answered.
    pub fn produce(&self, message: M, headers: MessageHeaders) -> BridgeResult<Option<Offset>> {
        let envelope = Envelope::outbound(message, headers, self.endpoint.name.clone());
        block_on(self.run(envelope, Mode::Blocking))?.map(|envelope| envelope.offset)
    }

    pub async fn produce_async(
        &self,
        message: M,
        headers: MessageHeaders,
    ) -> BridgeResult<Option<Offset>> {
        let envelope = Envelope::outbound(message, headers, self.endpoint.name.clone());
        Ok(self.run(envelope, Mode::Async).await?.offset)
    }

    /// Publishes a prepared envelope and hands it back with its offset attached.
    pub async fn produce_envelope(&self, envelope: Envelope<M>) -> BridgeResult<Envelope<M>> {
        self.run(envelope, Mode::Async).await
    }

    #[instrument(name = "bridge.produce", skip_all, fields(endpoint = %self.endpoint.name))]
    async fn run(&self, envelope: Envelope<M>, mode: Mode) -> BridgeResult<Envelope<M>> {
        let mut context = ProducerContext::new(envelope);
        let terminal = PublishTerminal {
            codec: &self.codec,
            transport: &self.transport,
            mode,
        };
        pipeline::execute(&self.behaviors, &mut context, &terminal).await?;
        if context.published {
            info!(
                endpoint = %self.endpoint.name,
                message_id = context.envelope.message_id().unwrap_or_default(),
                offset = context.envelope.offset.as_ref().map(ToString::to_string).unwrap_or_default(),
                "message produced"
            );
            metrics::counter!("bridge_messages_produced", "endpoint" => self.endpoint.name.clone())
                .increment(1);
        } else {
            debug!(endpoint = %self.endpoint.name, "pipeline declined to publish");
        }
        Ok(context.envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Blocking,
    Async,
}

struct PublishTerminal<'a, M: Send + Sync + 'static> {
    codec: &'a SharedCodec<M>,
    transport: &'a SharedPublishTransport,
    mode: Mode,
}

#[async_trait]
impl<'a, M> Terminal<ProducerContext<M>> for PublishTerminal<'a, M>
where
    M: Send + Sync + 'static,
{
    async fn invoke(&self, context: &mut ProducerContext<M>) -> BridgeResult<()> {
        let envelope = &mut context.envelope;
        let payload = match &envelope.raw {
            Some(raw) => raw.clone(),
            None => {
                let message = envelope.message.as_ref().ok_or_else(|| {
                    BridgeError::processing(anyhow::anyhow!(
                        "envelope carries neither a message nor a payload"
                    ))
                })?;
                let payload = self
                    .codec
                    .serialize(message, &envelope.headers)
                    .map_err(BridgeError::Processing)?;
                envelope.raw = Some(payload.clone());
                payload
            }
        };
        let raw = RawMessage {
            payload,
            headers: envelope.headers.clone(),
            endpoint: envelope.endpoint.clone(),
            offset: None,
        };
        envelope.offset = match self.mode {
            Mode::Blocking => self.transport.publish(&raw)?,
            Mode::Async => self.transport.publish_async(&raw).await?,
        };
        context.published = true;
        Ok(())
    }
}

/// Drives `future` to completion from synchronous code.
///
/// Inside a multi-threaded runtime the worker is handed off with
/// `block_in_place`. A current-thread runtime cannot drive its own timers
/// while blocked, so there the future runs on a scoped thread with a runtime
/// of its own. Outside any runtime one is built for the call.
pub(crate) fn block_on<F>(future: F) -> BridgeResult<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(|| run_to_completion(future))
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        }),
        Err(_) => run_to_completion(future),
    }
}

fn run_to_completion<F: Future>(future: F) -> BridgeResult<F::Output> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(BridgeError::processing)?;
    Ok(runtime.block_on(future))
}

pub type SharedProducer<M> = Arc<Producer<M>>;
