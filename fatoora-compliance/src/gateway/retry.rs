//! Bounded exponential backoff around one gateway call.
use super::{GatewayError, rate_limit::RateLimiter};
use crate::config::RetryPolicy;
use std::future::Future;
use tracing::{debug, warn};

/// Drive `operation` until it succeeds, fails permanently or runs out of
/// retries.
///
/// Every attempt draws from the rate-limit budget first; an exhausted budget
/// fails immediately without retrying. Transient failures sleep
/// `policy.delay_for(attempt)` before the next attempt.
pub async fn run<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &RateLimiter,
    label: &'static str,
    mut operation: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        limiter.check_budget()?;
        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(endpoint = label, attempts = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        if attempt >= policy.max_retries {
            warn!(endpoint = label, attempts = attempt + 1, error = %error, "retries exhausted");
            return Err(GatewayError::SubmissionFailed {
                attempts: attempt + 1,
                last_error: Box::new(error),
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            endpoint = label,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient gateway failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
