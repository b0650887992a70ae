use std::future::Future;

use tracing::{error, warn};

use crate::config::DuelConfig;
use crate::error::DuelError;
use crate::metrics::{TRANSACTION_RETRIES_TOTAL, TRANSACTION_RETRY_EXHAUSTED_TOTAL};
use crate::services::store::{DuelStore, DuelTx, IsolationLevel};
use crate::utils::retry::{retry_async_when, RetryConfig, RetryError};

pub const RETRIES_EXHAUSTED: &str = "Too many transaction retries";

/// Isolation level plus conflict retry budget for one use case.
#[derive(Debug, Clone)]
pub struct TransactionPolicy {
    pub isolation: IsolationLevel,
    pub retry: RetryConfig,
}

impl TransactionPolicy {
    pub fn new(isolation: IsolationLevel, config: &DuelConfig) -> Self {
        Self {
            isolation,
            retry: RetryConfig::linear(config.transaction_retries, config.retry_backoff()),
        }
    }

    pub fn serializable(config: &DuelConfig) -> Self {
        Self::new(IsolationLevel::Serializable, config)
    }

    pub fn repeatable_read(config: &DuelConfig) -> Self {
        Self::new(IsolationLevel::RepeatableRead, config)
    }
}

/// Runs `work` inside a fresh transaction and commits it.
///
/// `work` gets the transaction by value and hands it back with its result, so
/// every attempt starts from a new `begin`. Serialization conflicts, whether
/// raised by a read, a write or the commit, re-run the whole closure; any
/// other error is returned untouched. Running out of retries is an internal
/// error.
pub async fn run_in_transaction<T, F, Fut>(
    store: &dyn DuelStore,
    operation: &'static str,
    policy: &TransactionPolicy,
    work: F,
) -> Result<T, DuelError>
where
    F: Fn(Box<dyn DuelTx>) -> Fut,
    Fut: Future<Output = Result<(Box<dyn DuelTx>, T), DuelError>>,
{
    let work = &work;
    let isolation = policy.isolation;
    let max_attempts = policy.retry.max_attempts;

    let result = retry_async_when(
        policy.retry.clone(),
        |attempt, err: &DuelError| {
            if !err.is_conflict() {
                return false;
            }
            if attempt < max_attempts {
                TRANSACTION_RETRIES_TOTAL
                    .with_label_values(&[operation])
                    .inc();
                warn!(
                    operation,
                    attempt,
                    isolation = isolation.as_str(),
                    error = %err,
                    "transaction conflict, retrying"
                );
            }
            true
        },
        move || async move {
            let tx = store.begin(isolation).await?;
            let (tx, value) = work(tx).await?;
            tx.commit().await?;
            Ok::<T, DuelError>(value)
        },
    )
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(RetryError::Aborted(err)) => Err(err),
        Err(RetryError::Exhausted { attempts, last }) => {
            TRANSACTION_RETRY_EXHAUSTED_TOTAL
                .with_label_values(&[operation])
                .inc();
            error!(operation, attempts, error = %last, "transaction retries exhausted");
            Err(DuelError::internal(RETRIES_EXHAUSTED))
        }
    }
}
