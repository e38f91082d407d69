//! Deadline, cancellation and bounded retry around collaborator calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use ragpipe_shared::{CallContext, RagError, Result, RetryConfig};

use crate::breaker::CircuitBreaker;

/// Run `fut` until it completes, `call.timeout` elapses or `call.cancel` fires.
pub async fn bounded<T, F>(collaborator: &str, call: &CallContext, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = call.cancel.cancelled() => Err(RagError::Cancelled),
        outcome = tokio::time::timeout(call.timeout, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(RagError::CollaboratorTimeout {
                collaborator: collaborator.to_string(),
                timeout_ms: call.timeout.as_millis() as u64,
            }),
        },
    }
}

/// Sleep for `delay` unless cancelled first.
async fn pause(delay: Duration, call: &CallContext) -> Result<()> {
    tokio::select! {
        biased;
        _ = call.cancel.cancelled() => Err(RagError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Call `op` up to `1 + policy.max_retries` times within `call.timeout`.
///
/// The deadline is fixed on entry. Each attempt gets the smaller of
/// `attempt_timeout` and what is left of it, so retries never outlive the
/// caller's budget. Only retryable errors are retried. Each attempt is gated
/// by `breaker`; an open circuit ends the loop immediately.
pub async fn with_retry<T, F, Fut>(
    collaborator: &str,
    policy: &RetryConfig,
    breaker: &CircuitBreaker,
    call: &CallContext,
    attempt_timeout: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut(CallContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + call.timeout;
    let mut retry = 0;
    loop {
        if retry > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            pause(policy.backoff_for(retry).min(left), call).await?;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(RagError::CollaboratorTimeout {
                collaborator: collaborator.to_string(),
                timeout_ms: call.timeout.as_millis() as u64,
            });
        }

        let permit = breaker.try_acquire()?;
        let attempt = CallContext::new(left.min(attempt_timeout), call.cancel.clone());
        let outcome = bounded(collaborator, &attempt, op(attempt.clone())).await;
        permit.record(&outcome);

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || retry >= policy.max_retries => return Err(e),
            Err(e) => {
                retry += 1;
                warn!(
                    collaborator,
                    retry,
                    max_retries = policy.max_retries,
                    error = %e,
                    "collaborator call failed, retrying"
                );
            }
        }
    }
}
