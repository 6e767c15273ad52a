//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use parley_domain::config::RetryConfig;
use parley_domain::Result;

/// Run `op` up to `config.max_attempts` times, sleeping
/// `base_delay * 2^attempt` between tries. Only
/// [`parley_domain::Error::Transient`] failures are retried; anything else
/// propagates immediately, as does the last transient error once the
/// budget is spent.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = Duration::from_millis(config.base_delay_ms << (attempt - 1));
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "transient failure"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}
