//! Inbound deduplication stores.
//!
//! Connectors consult a [`DedupStore`] before relaying a message and record the
//! message's key once the batch holding it has been committed. Two flavours are
//! provided: an inbound log keyed by message identifier and an offset store
//! keeping the committed positions of each partition.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{Display, Formatter},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Identity of an inbound message for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DedupKey {
    /// Identified by the producer-assigned message id.
    Message { endpoint: String, message_id: String },
    /// Identified by the broker position inside a partition.
    Offset {
        endpoint: String,
        partition: String,
        position: String,
    },
}

impl DedupKey {
    pub fn message(endpoint: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::Message {
            endpoint: endpoint.into(),
            message_id: message_id.into(),
        }
    }

    pub fn offset(
        endpoint: impl Into<String>,
        partition: impl Into<String>,
        position: impl Into<String>,
    ) -> Self {
        Self::Offset {
            endpoint: endpoint.into(),
            partition: partition.into(),
            position: position.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Message { endpoint, .. } | Self::Offset { endpoint, .. } => endpoint,
        }
    }
}

impl Display for DedupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message {
                endpoint,
                message_id,
            } => write!(f, "{endpoint}:msg:{message_id}"),
            Self::Offset {
                endpoint,
                partition,
                position,
            } => write!(f, "{endpoint}:{partition}@{position}"),
        }
    }
}

/// Contract implemented by deduplication stores.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// `Ok(true)` when `key` was already recorded.
    async fn seen(&self, key: &DedupKey) -> Result<bool>;

    /// Marks `key` as processed.
    async fn record(&self, key: DedupKey) -> Result<()>;
}

/// Shared trait object wrapper.
pub type SharedDedupStore = Arc<dyn DedupStore>;

/// In-memory log of processed message identifiers with an optional TTL.
#[derive(Clone, Default)]
pub struct InMemoryInboundLog {
    inner: Arc<RwLock<HashMap<String, OffsetDateTime>>>,
    ttl: Option<Duration>,
}

impl InMemoryInboundLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries older than `ttl` no longer count as seen.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::default(),
            ttl: Some(ttl),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    fn is_live(&self, recorded_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        self.ttl.is_none_or(|ttl| recorded_at + ttl > now)
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let mut guard = self.inner.write().await;
        guard.retain(|_, recorded_at| *recorded_at + ttl > now);
    }
}

#[async_trait]
impl DedupStore for InMemoryInboundLog {
    async fn seen(&self, key: &DedupKey) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        let guard = self.inner.read().await;
        Ok(guard
            .get(&key.to_string())
            .is_some_and(|recorded_at| self.is_live(*recorded_at, now)))
    }

    async fn record(&self, key: DedupKey) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.insert(key.to_string(), OffsetDateTime::now_utc());
        Ok(())
    }
}

/// Committed positions of one partition.
///
/// Numeric positions are kept as inclusive ranges keyed by their start, so a
/// partition committed in order collapses to a single entry.
#[derive(Debug, Default)]
struct PartitionLog {
    ranges: BTreeMap<u64, u64>,
    opaque: HashSet<String>,
}

impl PartitionLog {
    fn contains(&self, position: &str) -> bool {
        match position.parse::<u64>() {
            Ok(position) => self
                .ranges
                .range(..=position)
                .next_back()
                .is_some_and(|(_, end)| position <= *end),
            Err(_) => self.opaque.contains(position),
        }
    }

    fn insert(&mut self, position: String) {
        let Ok(value) = position.parse::<u64>() else {
            self.opaque.insert(position);
            return;
        };
        if self.contains(&position) {
            return;
        }
        let mut start = value;
        if let Some((&before, &end)) = self.ranges.range(..value).next_back() {
            if end + 1 == value {
                start = before;
            }
        }
        let end = value
            .checked_add(1)
            .and_then(|next| self.ranges.remove(&next))
            .unwrap_or(value);
        self.ranges.insert(start, end);
    }

    fn watermark(&self) -> Option<u64> {
        self.ranges.first_key_value().map(|(_, end)| *end)
    }
}

/// Committed positions per `(endpoint, partition)`.
///
/// A position counts as seen only once it was itself recorded, so commits
/// arriving out of order never hide a position that was rolled back and is
/// still waiting for redelivery. Message keys carry no position and are never
/// considered seen.
#[derive(Clone, Default)]
pub struct InMemoryOffsetStore {
    partitions: Arc<RwLock<HashMap<(String, String), PartitionLog>>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the first unbroken run of committed numeric positions.
    pub async fn watermark(&self, endpoint: &str, partition: &str) -> Option<u64> {
        self.partitions
            .read()
            .await
            .get(&(endpoint.to_string(), partition.to_string()))
            .and_then(PartitionLog::watermark)
    }

    /// Number of disjoint committed ranges, a gap count plus one.
    pub async fn ranges(&self, endpoint: &str, partition: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(&(endpoint.to_string(), partition.to_string()))
            .map_or(0, |log| log.ranges.len())
    }
}

#[async_trait]
impl DedupStore for InMemoryOffsetStore {
    async fn seen(&self, key: &DedupKey) -> Result<bool> {
        let DedupKey::Offset {
            endpoint,
            partition,
            position,
        } = key
        else {
            return Ok(false);
        };
        let guard = self.partitions.read().await;
        Ok(guard
            .get(&(endpoint.clone(), partition.clone()))
            .is_some_and(|log| log.contains(position)))
    }

    async fn record(&self, key: DedupKey) -> Result<()> {
        let DedupKey::Offset {
            endpoint,
            partition,
            position,
        } = key
        else {
            debug!("offset store ignores keys without a position");
            return Ok(());
        };
        let mut guard = self.partitions.write().await;
        guard.entry((endpoint, partition)).or_default().insert(position);
        Ok(())
    }
}

/// Configuration derived at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupConfig {
    pub ttl_hours: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_hours: Some(36),
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads `BRIDGE_DEDUP_TTL_HOURS`; `0` disables expiry.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(parsed) = lookup("BRIDGE_DEDUP_TTL_HOURS").and_then(|v| v.trim().parse::<u64>().ok()) {
            cfg.ttl_hours = (parsed > 0).then_some(parsed);
        }
        cfg
    }

    pub fn inbound_log(&self) -> InMemoryInboundLog {
        match self.ttl_hours {
            Some(hours) => InMemoryInboundLog::with_ttl(Duration::hours(hours as i64)),
            None => InMemoryInboundLog::new(),
        }
    }
}

/// Wraps a store with logging and metrics for duplicate hits.
#[derive(Clone)]
pub struct DedupGuard {
    store: SharedDedupStore,
}

impl DedupGuard {
    pub fn new(store: SharedDedupStore) -> Self {
        Self { store }
    }

    /// Returns `Ok(true)` when the message must be skipped.
    #[instrument(name = "dedup.is_duplicate", skip(self, key), fields(key = %key))]
    pub async fn is_duplicate(&self, key: &DedupKey) -> Result<bool> {
        let seen = self.store.seen(key).await?;
        if seen {
            warn!(endpoint = %key.endpoint(), key = %key, "duplicate message skipped");
            metrics::counter!("bridge_duplicates_skipped", "endpoint" => key.endpoint().to_string())
                .increment(1);
        }
        Ok(seen)
    }

    pub async fn record(&self, key: DedupKey) -> Result<()> {
        self.store.record(key).await
    }
}
