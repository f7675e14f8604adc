//! Process-wide request limiter
//!
//! Two limits apply to every outbound platform request:
//! - at most `C` requests in flight (semaphore permits)
//! - request starts spaced by at least `D` (global pacing slot)
//!
//! Permits are RAII guards, so a failing or cancelled request still
//! returns its permit.

use crate::config::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    min_spacing: Duration,
    /// Earliest instant the next request may start
    next_slot: Mutex<Option<Instant>>,
}

/// Concurrency permit held for the duration of one request
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    /// Return the permit early; dropping the guard does the same
    pub fn release(self) {}
}

impl RateLimiter {
    /// Create a limiter allowing `max_concurrent` in-flight requests
    /// started no closer than `min_spacing_secs` apart
    pub fn new(max_concurrent: usize, min_spacing_secs: f64) -> Result<Self, ConfigError> {
        if max_concurrent < 1 {
            return Err(ConfigError::InvalidValue(format!(
                "rate limiter concurrency must be >= 1, got {}",
                max_concurrent
            )));
        }
        let min_spacing = Duration::try_from_secs_f64(min_spacing_secs).map_err(|_| {
            ConfigError::InvalidValue(format!(
                "rate limiter spacing must be >= 0 seconds, got {}",
                min_spacing_secs
            ))
        })?;

        Ok(Self::with_spacing(max_concurrent, min_spacing))
    }

    pub fn from_config(max_concurrent: usize, min_spacing: Duration) -> Result<Self, ConfigError> {
        Self::new(max_concurrent, min_spacing.as_secs_f64())
    }

    fn with_spacing(max_concurrent: usize, min_spacing: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            min_spacing,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for a concurrency permit and for this caller's pacing slot
    ///
    /// Fails only if the permit semaphore has been closed.
    pub async fn acquire(&self) -> Result<RatePermit, AcquireError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;

        if !self.min_spacing.is_zero() {
            let start_at = {
                let mut next_slot = self.next_slot.lock().await;
                let now = Instant::now();
                let start_at = match *next_slot {
                    Some(slot) if slot > now => slot,
                    _ => now,
                };
                *next_slot = Some(start_at + self.min_spacing);
                start_at
            };
            sleep_until(start_at).await;
        }

        Ok(RatePermit { _permit: permit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Permits not currently held
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
