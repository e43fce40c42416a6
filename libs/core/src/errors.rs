use crate::sequence::SequenceError;

/// Errors surfaced by producers, consumers and connectors.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// Endpoint or settings rejected before any I/O happened.
    #[error("invalid configuration for endpoint `{endpoint}`: {reason}")]
    Validation { endpoint: String, reason: String },
    /// The transport rejected or failed a publish.
    #[error("publish to `{endpoint}` failed")]
    Publish {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
    /// A stage, the codec or a subscriber failed while handling a message.
    #[error("processing failed: {0}")]
    Processing(#[source] anyhow::Error),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("consumer `{consumer}` on `{endpoint}` is not connected")]
    NotConnected { endpoint: String, consumer: String },
    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

impl BridgeError {
    pub fn validation(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn publish(endpoint: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Publish {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    pub fn processing(source: impl Into<anyhow::Error>) -> Self {
        Self::Processing(source.into())
    }

    /// Short machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Publish { .. } => "publish",
            Self::Processing(_) => "processing",
            Self::UnsupportedOperation(_) => "unsupported",
            Self::NotConnected { .. } => "not_connected",
            Self::Sequence(_) => "sequence",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
