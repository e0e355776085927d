//! Backoff for background fetches and deadlines for waits.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often, and how patiently, to retry a background fetch.
///
/// The defaults suit cache warm-up: a handful of attempts spread over a few
/// seconds, so a briefly unreachable origin still ends up cached.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Wait before the first retry.
    pub first_backoff: Duration,
    /// Upper bound for any single wait.
    pub max_backoff: Duration,
    /// Growth factor between consecutive waits.
    pub factor: u32,
    /// Stretch each wait by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            factor: 2,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    /// Wait before retry number `retry` (the first retry is 1).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let growth = self.factor.max(1).saturating_pow(retry - 1);
        let wait = self
            .first_backoff
            .saturating_mul(growth)
            .min(self.max_backoff);

        if self.jitter {
            wait + wait.mul_f64(jitter_fraction() / 4.0)
        } else {
            wait
        }
    }
}

/// Uniform-ish value in `[0, 1)`, seeded per call by the std hasher.
fn jitter_fraction() -> f64 {
    let bits = RandomState::new().build_hasher().finish();
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

/// Run `operation` until it succeeds or the attempts run out.
///
/// `what` names the operation in log lines, usually the URL being fetched.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts.max(1);
    let mut retry = 0;

    loop {
        if retry > 0 {
            let wait = config.backoff(retry);
            debug!(what, retry, ?wait, "Backing off");
            sleep(wait).await;
        }

        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(what, retry, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(e) if retry + 1 >= attempts => {
                warn!(what, attempts, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                debug!(what, retry, error = %e, "Attempt failed");
            }
        }

        retry += 1;
    }
}

/// Bound a wait. Elapsing yields [`crate::PageRouteError::Timeout`].
pub async fn with_timeout<T, F, Fut>(
    timeout: Duration,
    operation: F,
) -> Result<T, crate::PageRouteError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::PageRouteError::Timeout(timeout))
}
