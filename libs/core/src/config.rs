//! Runtime configuration read from `BRIDGE_*` environment variables.

use std::time::Duration;

use crate::endpoint::{
    ConsumerEndpoint, DEFAULT_BACKPRESSURE_LIMIT, DEFAULT_BATCH_SIZE, DEFAULT_CONSUMERS,
    ProducerEndpoint,
};

pub const DEFAULT_ENDPOINT: &str = "bridge.events";

/// Which inbound deduplication strategy to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupMode {
    #[default]
    Disabled,
    MessageId,
    Offset,
}

impl DedupMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "disabled" => Some(Self::Disabled),
            "message-id" | "message_id" | "id" => Some(Self::MessageId),
            "offset" => Some(Self::Offset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub producer: ProducerEndpoint,
    pub consumer: ConsumerEndpoint,
    /// Payloads above this many bytes are split into chunks.
    pub chunk_size: Option<usize>,
    pub retry: RetrySettings,
    pub dedup: DedupMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            producer: ProducerEndpoint::new(DEFAULT_ENDPOINT),
            consumer: ConsumerEndpoint::new(DEFAULT_ENDPOINT),
            chunk_size: None,
            retry: RetrySettings::default(),
            dedup: DedupMode::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `lookup`. Unparseable or out-of-range
    /// values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let count = |name: &str, default: usize| {
            text(name)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(default)
        };

        if let Some(name) = text("BRIDGE_PRODUCER_ENDPOINT") {
            cfg.producer = ProducerEndpoint::new(name);
        }
        let consumer_name = text("BRIDGE_CONSUMER_ENDPOINT").unwrap_or_else(|| cfg.producer.name.clone());
        cfg.consumer = ConsumerEndpoint::new(consumer_name)
            .with_consumers(count("BRIDGE_CONSUMERS", DEFAULT_CONSUMERS))
            .with_batch_size(count("BRIDGE_BATCH_SIZE", DEFAULT_BATCH_SIZE))
            .with_backpressure_limit(count("BRIDGE_BACKPRESSURE_LIMIT", DEFAULT_BACKPRESSURE_LIMIT));
        cfg.chunk_size = text("BRIDGE_CHUNK_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1);
        if let Some(retries) = text("BRIDGE_RETRY_MAX").and_then(|v| v.parse::<u32>().ok()) {
            cfg.retry.max_retries = retries;
        }
        if let Some(ms) = text("BRIDGE_RETRY_BACKOFF_MS").and_then(|v| v.parse::<u64>().ok()) {
            cfg.retry.backoff = Duration::from_millis(ms);
        }
        if let Some(mode) = text("BRIDGE_DEDUP").and_then(|v| DedupMode::parse(&v)) {
            cfg.dedup = mode;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(BridgeConfig::from_lookup(|_| None), BridgeConfig::default());
    }

    #[test]
    fn reads_every_setting() {
        let cfg = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_PRODUCER_ENDPOINT", "orders"),
            ("BRIDGE_CONSUMERS", "4"),
            ("BRIDGE_BATCH_SIZE", "25"),
            ("BRIDGE_BACKPRESSURE_LIMIT", "8"),
            ("BRIDGE_CHUNK_SIZE", "1024"),
            ("BRIDGE_RETRY_MAX", "0"),
            ("BRIDGE_RETRY_BACKOFF_MS", "10"),
            ("BRIDGE_DEDUP", "offset"),
        ]));
        assert_eq!(cfg.producer.name, "orders");
        assert_eq!(cfg.consumer.name, "orders");
        assert_eq!(cfg.consumer.consumers, 4);
        assert_eq!(cfg.consumer.batch_size, 25);
        assert_eq!(cfg.consumer.backpressure_limit, 8);
        assert_eq!(cfg.chunk_size, Some(1024));
        assert_eq!(cfg.retry.max_retries, 0);
        assert_eq!(cfg.retry.backoff, Duration::from_millis(10));
        assert_eq!(cfg.dedup, DedupMode::Offset);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_CONSUMERS", "0"),
            ("BRIDGE_BATCH_SIZE", "many"),
            ("BRIDGE_CHUNK_SIZE", "0"),
            ("BRIDGE_DEDUP", "sometimes"),
            ("BRIDGE_CONSUMER_ENDPOINT", "  "),
        ]));
        assert_eq!(cfg.consumer.consumers, DEFAULT_CONSUMERS);
        assert_eq!(cfg.consumer.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.consumer.name, DEFAULT_ENDPOINT);
        assert_eq!(cfg.chunk_size, None);
        assert_eq!(cfg.dedup, DedupMode::Disabled);
        assert!(cfg.consumer.validate().is_ok());
    }
}
