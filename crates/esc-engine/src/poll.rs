use std::time::Duration;

use tracing::debug;

use crate::error::EngineError;

/// Poll `predicate` up to `max_attempts` times, sleeping `interval` between
/// attempts, until it resolves `Ok(Some(value))`. Factors the
/// `(max-attempts, interval, predicate)` shape every handler's wait-step
/// shares (spec §4.4/§9) into one place so timeouts and log cadence stay
/// uniform.
pub async fn poll_until<F, Fut, T>(
    what: &str,
    max_attempts: u32,
    interval: Duration,
    mut predicate: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, EngineError>>,
{
    for attempt in 1..=max_attempts {
        if let Some(value) = predicate().await? {
            return Ok(value);
        }
        debug!(what, attempt, max_attempts, "still waiting");
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(EngineError::Unrecoverable(format!(
        "timed out polling for {what}: no success after {max_attempts} attempts"
    )))
}
