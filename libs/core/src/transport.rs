//! Broker-facing seams. Concrete brokers implement these; the pipeline never
//! talks to a broker any other way.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Offset, RawMessage};
use crate::errors::BridgeResult;

/// Outbound side of a broker.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    /// Publishes and blocks until the broker answered.
    fn publish(&self, message: &RawMessage) -> BridgeResult<Option<Offset>>;

    async fn publish_async(&self, message: &RawMessage) -> BridgeResult<Option<Offset>>;
}

/// Inbound side of a broker.
#[async_trait]
pub trait ReceiveTransport: Send + Sync {
    /// Waits for up to `max` messages. `None` means the source is closed.
    async fn receive(&self, endpoint: &str, max: usize) -> anyhow::Result<Option<Vec<RawMessage>>>;
}

/// Acknowledges consumed positions back to the broker.
#[async_trait]
pub trait AckTransport: Send + Sync {
    async fn commit(&self, endpoint: &str, offsets: &[Offset]) -> anyhow::Result<()>;

    /// Gives the positions back so the broker redelivers them.
    async fn rollback(&self, endpoint: &str, offsets: &[Offset]) -> anyhow::Result<()>;
}

pub type SharedPublishTransport = Arc<dyn PublishTransport>;
pub type SharedReceiveTransport = Arc<dyn ReceiveTransport>;
pub type SharedAckTransport = Arc<dyn AckTransport>;
