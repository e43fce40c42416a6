//! Stock pipeline stages.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{BridgeError, BridgeResult};
use crate::headers::MESSAGE_ID_HEADER;
use crate::pipeline::{Behavior, Next};
use crate::producer::ProducerContext;

/// Re-runs the rest of the chain when it fails with a retryable error.
///
/// Validation, unsupported-operation and not-connected errors are returned
/// immediately. The delay doubles after every failed attempt.
#[derive(Debug, Clone)]
pub struct RetryBehavior {
    max_retries: u32,
    backoff: Duration,
}

impl RetryBehavior {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn is_retryable(err: &BridgeError) -> bool {
        matches!(err, BridgeError::Publish { .. } | BridgeError::Processing(_))
    }
}

#[async_trait]
impl<C: Send + 'static> Behavior<C> for RetryBehavior {
    async fn handle(&self, context: &mut C, next: Next<'_, C>) -> BridgeResult<()> {
        let mut attempt = 0;
        let mut delay = self.backoff;
        loop {
            match next.run(context).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.max_retries && Self::is_retryable(&err) => {
                    attempt += 1;
                    warn!(attempt, max_retries = self.max_retries, error = %err, "retrying pipeline");
                    metrics::counter!("bridge_pipeline_retries", "code" => err.code()).increment(1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Stamps a fresh `x-message-id` on outbound envelopes that have none.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageIdBehavior;

#[async_trait]
impl<M: Send + Sync + 'static> Behavior<ProducerContext<M>> for MessageIdBehavior {
    async fn handle(
        &self,
        context: &mut ProducerContext<M>,
        next: Next<'_, ProducerContext<M>>,
    ) -> BridgeResult<()> {
        context
            .envelope
            .headers
            .add_if_missing(MESSAGE_ID_HEADER, Uuid::new_v4().to_string());
        next.run(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{SharedBehavior, Terminal, execute};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> BridgeError,
    }

    #[async_trait]
    impl Terminal<()> for Flaky {
        async fn invoke(&self, _context: &mut ()) -> BridgeResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(())
        }
    }

    fn publish_error() -> BridgeError {
        BridgeError::publish("orders", anyhow::anyhow!("broker unavailable"))
    }

    fn unsupported() -> BridgeError {
        BridgeError::UnsupportedOperation("nope")
    }

    fn retry(max: u32) -> Vec<SharedBehavior<()>> {
        vec![Arc::new(RetryBehavior::new(max, Duration::ZERO))]
    }

    #[tokio::test]
    async fn retries_until_the_terminal_succeeds() {
        let terminal = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: publish_error,
        };
        execute(&retry(3), &mut (), &terminal).await.unwrap();
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let terminal = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: publish_error,
        };
        let err = execute(&retry(2), &mut (), &terminal).await.unwrap_err();
        assert!(matches!(err, BridgeError::Publish { .. }));
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_unsupported_operations() {
        let terminal = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: unsupported,
        };
        let err = execute(&retry(5), &mut (), &terminal).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedOperation(_)));
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let terminal = Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
            error: publish_error,
        };
        let stages: Vec<SharedBehavior<()>> =
            vec![Arc::new(RetryBehavior::new(3, Duration::from_millis(100)))];
        let started = tokio::time::Instant::now();
        execute(&stages, &mut (), &terminal).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
    }
}
