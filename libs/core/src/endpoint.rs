use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};

/// Default number of consumers bound to an inbound endpoint.
pub const DEFAULT_CONSUMERS: usize = 1;
/// Default maximum number of raw messages handed to one batch.
pub const DEFAULT_BATCH_SIZE: usize = 1;
/// Default number of batches a consumer may buffer ahead of processing.
pub const DEFAULT_BACKPRESSURE_LIMIT: usize = 50;

fn validate_name(name: &str) -> BridgeResult<()> {
    if name.trim().is_empty() {
        return Err(BridgeError::validation(name, "endpoint name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(BridgeError::validation(
            name,
            "endpoint name must not contain whitespace",
        ));
    }
    Ok(())
}

/// Destination a producer publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerEndpoint {
    pub name: String,
}

impl ProducerEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        validate_name(&self.name)
    }
}

/// Source an inbound connector consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerEndpoint {
    pub name: String,
    /// Number of consumers (independent receive loops) bound to the endpoint.
    pub consumers: usize,
    pub batch_size: usize,
    pub backpressure_limit: usize,
}

impl ConsumerEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumers: DEFAULT_CONSUMERS,
            batch_size: DEFAULT_BATCH_SIZE,
            backpressure_limit: DEFAULT_BACKPRESSURE_LIMIT,
        }
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_backpressure_limit(mut self, limit: usize) -> Self {
        self.backpressure_limit = limit;
        self
    }

    pub fn validate(&self) -> BridgeResult<()> {
        validate_name(&self.name)?;
        if self.consumers == 0 {
            return Err(BridgeError::validation(
                &self.name,
                "consumers must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(BridgeError::validation(
                &self.name,
                "batch_size must be at least 1",
            ));
        }
        if self.backpressure_limit == 0 {
            return Err(BridgeError::validation(
                &self.name,
                "backpressure_limit must be at least 1",
            ));
        }
        Ok(())
    }
}
