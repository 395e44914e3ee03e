//! ============================================================================
//! Retry Logic - Bounded Timeouts & Exponential Backoff
//! ============================================================================
//! Every network-facing backend call (embeddings, vector index, profile
//! store, turn log, language model) goes through `with_retry`:
//! - Each attempt runs under a hard timeout
//! - Transient failures back off exponentially with optional jitter
//! - Permanent failures (validation, configuration, corrupt data) return
//!   immediately
//! ============================================================================

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::types::{MemoryError, MemoryResult};

/// Configuration for backend retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay between retries (multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Hard limit for a single attempt
    pub attempt_timeout_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            attempt_timeout_ms: 5000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% on top of the capped delay
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..=0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt is bounded by `config.attempt_timeout_ms`; an attempt that
/// overruns counts as a transient `MemoryError::Timeout`.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> MemoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MemoryResult<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = calculate_delay(attempt - 1, config);
            debug!("{}: retry attempt {} after {:?}", operation, attempt + 1, delay);
            sleep(delay).await;
        }

        let result = match timeout(config.attempt_timeout(), op()).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Timeout {
                operation: operation.to_string(),
                after_ms: config.attempt_timeout_ms,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    "{}: attempt {}/{} failed: {}",
                    operation,
                    attempt + 1,
                    attempts,
                    e
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| MemoryError::Timeout {
        operation: operation.to_string(),
        after_ms: config.attempt_timeout_ms,
    }))
}
