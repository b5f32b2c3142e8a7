//! Generic retry executor shared by the orchestrator.
//!
//! Applies the same backoff semantics as per-action retries: fixed, linear or
//! exponential delays clamped by the policy's maximum, retrying only errors
//! whose kind the policy covers. Delays are cancellable.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::definition::RetryPolicy;
use crate::{EngineError, EngineResult};

/// Run `op` under the given retry policy. The closure receives the 1-based
/// attempt number.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    cancellation: Option<&CancellationToken>,
    mut op: F,
) -> EngineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !policy.applies_to(error.kind()) {
                    return Err(error);
                }
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, error = %error, "retrying operation");
                match cancellation {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return Err(error),
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
                attempt += 1;
            }
        }
    }
}
