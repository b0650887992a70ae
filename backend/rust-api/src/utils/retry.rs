use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_backoff * attempt`
    Linear,
    /// Doubles after every failed attempt.
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(50)),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryConfig {
    /// `retries` extra attempts after the first one, waiting `step * attempt`
    /// between them.
    pub fn linear(retries: usize, step: Duration) -> Self {
        Self {
            max_attempts: retries + 1,
            base_backoff: step,
            max_backoff: step.saturating_mul(retries.max(1) as u32),
            jitter_max: None,
            backoff: Backoff::Linear,
        }
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        let base = match self.backoff {
            Backoff::Linear => self.base_backoff.saturating_mul(attempt as u32),
            Backoff::Exponential => self
                .base_backoff
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1) as u32)),
        };
        let base = std::cmp::min(base, self.max_backoff);

        match self.jitter_max {
            Some(jitter_max) if !jitter_max.is_zero() => {
                let jitter_ms = jitter_max.as_millis() as u64;
                base + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
            }
            _ => base,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("{0}")]
    Aborted(E),
}

/// Retries every error until the attempts run out.
pub async fn retry_async_with_config<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    retry_async_when(config, |_, _| true, f)
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted(err) => err,
        })
}

/// Retries only errors accepted by `should_retry`, which receives the number of
/// the attempt that just failed (1-based). Rejected errors come back as
/// `Aborted` right away.
pub async fn retry_async_when<F, Fut, P, T, E>(
    config: RetryConfig,
    mut should_retry: P,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: FnMut(usize, &E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !should_retry(attempt, &e) {
                    return Err(RetryError::Aborted(e));
                }
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                tokio::time::sleep(config.delay_after(attempt)).await;
            }
        }
    }
}
