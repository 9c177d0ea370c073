//! # exchange::retry
//!
//! Bounded retry for single exchange calls.
//!
//! Every call gets a hard timeout, and only transient failures are retried. A
//! rejected order or a 4xx is returned on the first attempt: retrying those would
//! just repeat the same answer (or, worse, repeat a submission).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::GuardError;
use crate::exchange::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never zero.
    pub attempts: u32,
    /// Linear backoff: attempt `n` waits `n * backoff` before retrying.
    pub backoff:  Duration,
    /// Upper bound for one call.
    pub timeout:  Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff:  Duration::from_millis(500),
            timeout:  Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retry. Used for `submit_order`: a timed-out submit may
    /// still have reached the venue, so it is never blindly re-sent.
    pub fn single(self) -> Self {
        Self { attempts: 1, ..self }
    }
}

/// Runs `call` until it succeeds, fails non-transiently, or the attempts run out.
pub async fn with_retry<T, F, Fut>(
    op: &'static str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, GuardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(op, attempt, max = attempts, error = %e, "Transient exchange error, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) if e.is_transient() => {
                return Err(GuardError::TransientIo { op, attempts: attempt, source: e });
            }
            Err(e) => return Err(GuardError::Exchange(e)),
        }
    }
}
