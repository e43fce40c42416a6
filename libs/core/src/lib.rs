//! Broker bridge core: message envelopes, the behavior pipeline, producers,
//! the outbound queue, sequences and chunk reassembly, consumers and the
//! inbound connector.
//!
//! Brokers plug in through the traits in [`transport`]; everything else is
//! broker-agnostic. Application messages are typed as `M` and converted to
//! bytes by a [`Codec`].
pub mod behaviors;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod endpoint;
pub mod envelope;
pub mod errors;
pub mod headers;
pub mod outbox;
pub mod pipeline;
pub mod producer;
pub mod routing;
pub mod sequence;
pub mod testkit;
pub mod transport;

pub use behaviors::*;
pub use chunk::{ChunkHeader, ChunkReassembler, ChunkingTransport, split_into_chunks};
pub use codec::*;
pub use config::*;
pub use connector::*;
pub use consumer::*;
pub use endpoint::*;
pub use envelope::*;
pub use errors::*;
pub use headers::*;
pub use outbox::*;
pub use pipeline::{Behavior, Next, SharedBehavior, Terminal, execute};
pub use producer::{Producer, ProducerContext, SharedProducer};
pub use routing::*;
pub use sequence::{
    AbortReason, Sequence, SequenceError, SequenceKind, SequenceKindTag, SequenceStatus,
    SequenceStore,
};
pub use transport::*;

/// Returns the semantic version advertised by this crate.
///
/// ```
/// assert_eq!(bridge_core::version(), env!("CARGO_PKG_VERSION"));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
