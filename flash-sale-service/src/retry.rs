use futures::future::BoxFuture;
use std::time::Duration;
use tracing::warn;

use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::store::{Store, Transaction};

/// Bounded retry for transactions that fail on lock contention.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.transaction_attempts.max(1),
            backoff: settings.retry_backoff,
        }
    }

    /// Linear backoff: the n-th retry waits n times the base delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Runs `work` inside a fresh transaction, committing on `Ok` and rolling
/// back on `Err`. Transient failures start over with a new transaction until
/// the policy's attempts are used up.
pub async fn in_transaction<S, T, F>(store: &S, policy: RetryPolicy, operation: &'static str, mut work: F) -> EngineResult<T>
where
    S: Store,
    T: Send,
    F: for<'t> FnMut(&'t mut S::Tx) -> BoxFuture<'t, EngineResult<T>> + Send,
{
    let mut attempt = 1;
    loop {
        let result = run_once(store, &mut work).await;

        match result {
            Err(EngineError::Store(err)) if err.is_transient() => {
                if attempt >= policy.max_attempts {
                    warn!(operation, attempt, error = %err, "Transaction retries exhausted");
                    return Err(EngineError::RetriesExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                warn!(operation, attempt, error = %err, "Transient store failure, retrying transaction");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn run_once<S, T, F>(store: &S, work: &mut F) -> EngineResult<T>
where
    S: Store,
    T: Send,
    F: for<'t> FnMut(&'t mut S::Tx) -> BoxFuture<'t, EngineResult<T>> + Send,
{
    let mut tx = store.begin().await?;
    match work(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
