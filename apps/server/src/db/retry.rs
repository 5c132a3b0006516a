//! Bounded retry of transient store failures
//!
//! Only failures that a second attempt can plausibly fix are retried:
//! connection I/O, pool exhaustion, serialization failures and deadlocks.
//! When the budget is spent they surface as [`Error::Unavailable`].

use std::{future::Future, time::Duration};

use crate::{config::RetryConfig, metrics, Error, Result};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: 2.0,
        }
    }

    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, attempt, "Store call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if is_transient(&err) => {
                    if attempt >= self.max_retries {
                        tracing::warn!(
                            operation,
                            attempts = attempt + 1,
                            error = %err,
                            "Store retries exhausted"
                        );
                        return Err(Error::Unavailable(format!("{operation}: {err}")));
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient store failure, retrying"
                    );
                    metrics::record_store_retry(operation);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::Database(db) => is_transient_sqlx(db),
        _ => false,
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

/// Map a transient failure inside a transaction, where retrying the single
/// statement is not possible, to `Unavailable`.
pub fn surface(err: Error) -> Error {
    if is_transient(&err) {
        Error::Unavailable(err.to_string())
    } else {
        err
    }
}
