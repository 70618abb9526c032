//! Retry Policy - Bounded Exponential Backoff with Jitter
//!
//! One executor shared by the save queue and the transport's token refresh.
//! After failed attempt `n` (0-based) the policy sleeps
//! `min(base × factor^n, max_delay)`, scaled by a random factor in
//! `[1 - jitter, 1 + jitter]`, then tries again until `max_attempts` total
//! attempts have been made. The last error is returned on exhaustion.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_JITTER_FRACTION: f64 = 0.2;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Classifies errors for the retry executor
pub trait Retryable {
    /// Whether another attempt could succeed
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction of each delay that is randomized, in `[0, 1)`
    pub jitter_fraction: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Retries without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter_fraction: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Un-jittered wait after failed attempt `attempt` (0-based)
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else if secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    /// Jittered wait after failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter = self.jitter_fraction.clamp(0.0, 0.99);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let scale = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64(base.as_secs_f64() * scale)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached. The closure receives the 0-based attempt.
    pub async fn execute<T, E, F, Fut>(&self, context: &str, operation: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_when(context, operation, |e: &E| e.is_retryable()).await
    }

    /// Like [`execute`](Self::execute) with a caller-supplied retry predicate.
    pub async fn execute_when<T, E, F, Fut, P>(
        &self,
        context: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        log::info!("{} succeeded on attempt {}/{}", context, attempt + 1, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        log::warn!("{} failed with non-retryable error: {}", context, e);
                        return Err(e);
                    }

                    if attempt + 1 >= max_attempts {
                        log::error!("{} failed after {} attempts: {}", context, max_attempts, e);
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed: {}. Retrying in {}ms (attempt {}/{})",
                        context,
                        e,
                        delay.as_millis(),
                        attempt + 2,
                        max_attempts
                    );

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
