//! In-process bus the inbound connector relays message batches onto.

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("subscriber `{subscriber}` failed")]
    Subscriber {
        subscriber: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Delivers a batch to in-process subscribers and reports their failures.
#[async_trait]
pub trait BusRelay<T: Send + Sync>: Send + Sync {
    async fn publish(&self, batch: &[T]) -> Result<(), BusError>;
}

pub type SharedBusRelay<T> = Arc<dyn BusRelay<T>>;

#[async_trait]
pub trait Subscriber<T: Send + Sync>: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, batch: &[T]) -> anyhow::Result<()>;
}

/// Fans every batch out to its subscribers in registration order, stopping at
/// the first failure.
pub struct InMemoryBus<T: Send + Sync> {
    subscribers: RwLock<Vec<Arc<dyn Subscriber<T>>>>,
}

impl<T: Send + Sync> Default for InMemoryBus<T> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Send + Sync> InMemoryBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl<T: Send + Sync> BusRelay<T> for InMemoryBus<T> {
    async fn publish(&self, batch: &[T]) -> Result<(), BusError> {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber
                .handle(batch)
                .await
                .map_err(|source| BusError::Subscriber {
                    subscriber: subscriber.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// Subscriber keeping every item it received, for tests and demos.
#[derive(Clone)]
pub struct RecordingSubscriber<T> {
    name: String,
    received: Arc<Mutex<Vec<T>>>,
}

impl<T> RecordingSubscriber<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn take_received(&self) -> Vec<T> {
        let mut guard = self.received.lock().await;
        std::mem::take(&mut *guard)
    }

    pub async fn count(&self) -> usize {
        self.received.lock().await.len()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Subscriber<T> for RecordingSubscriber<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, batch: &[T]) -> anyhow::Result<()> {
        let mut guard = self.received.lock().await;
        guard.extend(batch.iter().cloned());
        Ok(())
    }
}
