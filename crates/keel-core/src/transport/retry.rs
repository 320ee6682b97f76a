//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Marker error for an operation abandoned because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Errors that can tell whether a retry may help.
pub trait Retryable {
    /// True for failures worth retrying (network blips, 5xx).
    fn is_transient(&self) -> bool;
}

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Randomize each delay to 50-100% of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with no waiting between attempts, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Nominal delay before retry number `retry` (1-based), jitter applied.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let nominal = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        if self.jitter && !nominal.is_zero() {
            nominal.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            nominal
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. Backoff sleeps abort early when `cancel` fires.
///
/// # Errors
///
/// Returns the last error from `op`, or `E::from(Cancelled)` if cancelled
/// while waiting.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + From<Cancelled> + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{what}: attempt {attempt}/{attempts} failed ({e}), retrying in {}ms",
                    delay.as_millis()
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Cancelled.into()),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                debug!("{what}: giving up after {attempt} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}
