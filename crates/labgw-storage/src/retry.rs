//! Bounded retry with exponential backoff and jitter.
//!
//! Only transient failures (connection loss, deadlock, pool exhaustion)
//! are retried, and only inside caller-scoped operations; background work
//! logs and moves on. The budget is deliberately small so a real outage
//! surfaces as `Unavailable` within a few hundred milliseconds.

use std::future::Future;
use std::time::Duration;

use labgw_core::{GatewayResult, OpContext};
use rand::Rng;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(50);

/// Run `op` up to three times, backing off between transient failures.
/// Cancellation is re-checked before every attempt and during backoff.
pub(crate) async fn with_backoff<T, F, Fut>(
    ctx: &OpContext,
    op_name: &'static str,
    mut op: F,
) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        ctx.check()?;
        match ctx.run(op()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                let delay = backoff + Duration::from_millis(jitter);
                warn!(
                    correlation_id = ctx.correlation_id(),
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient persistence failure, retrying"
                );
                ctx.run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgw_core::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let ctx = OpContext::new();
        let attempts = AtomicU32::new(0);
        let result = with_backoff(&ctx, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::unavailable_transient("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let ctx = OpContext::new();
        let attempts = AtomicU32::new(0);
        let result: GatewayResult<()> = with_backoff(&ctx, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::unavailable_permanent("schema mismatch")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let ctx = OpContext::new();
        let attempts = AtomicU32::new(0);
        let result: GatewayResult<()> = with_backoff(&ctx, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::unavailable_transient("still down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let ctx = OpContext::new();
        ctx.cancel();
        let result: GatewayResult<()> =
            with_backoff(&ctx, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }
}
