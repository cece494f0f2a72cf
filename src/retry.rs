//! Retry with exponential backoff for rate-limited API calls.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// First backoff delay; doubles on every further retry.
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Run `operation`, retrying on errors `is_rate_limit` classifies as
/// rate limiting. Retry `n` sleeps `BASE_RETRY_DELAY_MS * 2^n` milliseconds.
/// Any other error, or a rate-limit error once `max_attempts` retries are
/// spent, propagates unchanged. Holds no state across calls.
pub async fn with_retry<T, E, F, Fut, P>(
    mut operation: F,
    is_rate_limit: P,
    max_attempts: u32,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if is_rate_limit(&err) && attempt < max_attempts => {
                let delay = backoff_delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "rate limited; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `BASE_RETRY_DELAY_MS * 2^attempt`, saturating at `u64::MAX` milliseconds
/// so a deep retry budget cannot overflow the shift.
fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_RETRY_DELAY_MS.saturating_mul(multiplier))
}
