//! Bounded exponential backoff with jitter
//!
//! Delay before retry `n` (0-based) is `base * 2^n` plus jitter drawn
//! from `[0, base)`, capped at `max_delay`. A server-provided hint
//! (e.g. `Retry-After`) replaces the computed delay, still capped.

use crate::config::RetryConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Failure classification consumed by [`RetryPolicy`]
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Server-suggested wait before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display + fmt::Debug> {
    #[error("fatal error: {0}")]
    Fatal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: E },
}

impl<E: fmt::Display + fmt::Debug> RetryError<E> {
    /// The underlying failure
    pub fn cause(&self) -> &E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::ExhaustedRetries { last, .. } => last,
        }
    }

    pub fn into_cause(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::ExhaustedRetries { last, .. } => last,
        }
    }
}

/// Successful result plus the retries it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub retries: u32,
}

#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max_delay: Duration,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max_delay: Duration) -> Self {
        Self::with_rng(max_attempts, base, max_delay, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests
    pub fn with_seed(max_attempts: u32, base: Duration, max_delay: Duration, seed: u64) -> Self {
        Self::with_rng(max_attempts, base, max_delay, StdRng::seed_from_u64(seed))
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base, config.max_delay)
    }

    fn with_rng(max_attempts: u32, base: Duration, max_delay: Duration, rng: StdRng) -> Self {
        Self {
            max_attempts,
            base,
            max_delay,
            rng: Mutex::new(rng),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base
            .checked_mul(2_u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay);
        let jitter = self.jitter();
        std::cmp::min(exponential.saturating_add(jitter), self.max_delay)
    }

    fn jitter(&self) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let fraction: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..1.0),
        };
        self.base.mul_f64(fraction)
    }

    /// Run `operation`, retrying retryable failures
    ///
    /// Fatal failures return immediately; retryable ones are retried up
    /// to `max_attempts` times before surfacing as `ExhaustedRetries`.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Retryable + fmt::Display + fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        retries: attempt,
                    })
                }
                Err(err) if !err.is_retryable() => return Err(RetryError::Fatal(err)),
                Err(err) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::ExhaustedRetries {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }

                    let delay = match err.retry_after() {
                        Some(hint) => std::cmp::min(hint, self.max_delay),
                        None => self.delay_for(attempt),
                    };

                    log::warn!(
                        "⏳ Retry attempt {} of {} in {:.2}s: {}",
                        attempt + 1,
                        self.max_attempts,
                        delay.as_secs_f64(),
                        err
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
