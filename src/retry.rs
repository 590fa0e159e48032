//! Bounded retry with exponential backoff for external-service calls.
//!
//! Every call to an extraction, embedding, or summarization service goes
//! through [`RetryPolicy::run`]:
//!
//! - each try is bounded by the stage timeout (a timeout counts as transient);
//! - [`ServiceError::Transient`] is retried until the ceiling is reached;
//! - [`ServiceError::Permanent`] returns immediately;
//! - the delay doubles from `backoff_base_ms`, capped at `backoff_max_ms`.

use std::future::Future;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub ceiling: u32,
    pub base: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ceiling: config.retry_ceiling.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            timeout: config.stage_timeout(),
        }
    }

    /// Delay before try number `attempt` (1-based; the first try has none).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut last_err = None;

        for attempt in 1..=self.ceiling {
            let delay = self.delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::transient(format!(
                    "{} timed out after {:?}",
                    label, self.timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err @ ServiceError::Permanent { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(label, attempt, ceiling = self.ceiling, error = %err, "transient failure");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ServiceError::transient(format!("{} failed after retries", label))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(ceiling: u32) -> RetryPolicy {
        RetryPolicy {
            ceiling,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            ceiling: 6,
            base: Duration::from_millis(500),
            max: Duration::from_millis(1500),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(1000));
        assert_eq!(policy.delay(4), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::transient("busy"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_ceiling_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::transient("busy"))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::permanent("unsupported_format", "tiff"))
            })
            .await;
        assert!(!result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let result: Result<(), _> = fast(2)
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
    }
}
