//! Request pipeline: the uniform wrapper around every caller-facing
//! operation.
//!
//! Four concerns compose, in order:
//! 1. Correlation and timing - a fresh correlation id and start time are
//!    attached to the `OpContext` and to a tracing span, so every log
//!    line downstream carries the same id.
//! 2. Validation - requests are rejected with `InvalidArgument` before
//!    any side effect.
//! 3. Metrics - request counters and latency histograms labeled by method
//!    and terminal status; the active-request gauge brackets the call.
//! 4. Panic containment - an unexpected fault is caught, logged with its
//!    correlation id, and surfaced as `Internal` (validation-flavored
//!    panics become `InvalidArgument`, persistence-flavored ones
//!    `Unavailable`).
//!
//! Cancellation propagates through the `OpContext` handed to the handler;
//! when the caller disconnects or the per-operation deadline fires, all
//! downstream work stops at its next suspension point.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use labgw_core::{GatewayError, GatewayResult, OpContext};
use tonic::{Code, Request, Response, Status};
use tracing::{error, info_span, Instrument};

use crate::error_mapping::{map_gateway_error_to_status, status_code_for};
use crate::metrics::METRICS;

/// Pipeline configuration shared by all operations of one service
/// instance.
#[derive(Debug, Clone)]
pub struct Pipeline {
    default_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    fn new_context(&self) -> OpContext {
        match self.default_timeout {
            Some(timeout) => OpContext::with_timeout(timeout),
            None => OpContext::new(),
        }
    }

    /// Wrap a unary operation.
    pub async fn unary<Req, Resp, V, H, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        validate: V,
        handler: H,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Send,
        V: FnOnce(&Req) -> GatewayResult<()>,
        H: FnOnce(OpContext, Req) -> Fut,
        Fut: std::future::Future<Output = GatewayResult<Resp>> + Send,
    {
        let ctx = self.new_context();
        let span = info_span!("rpc", method, correlation_id = %ctx.correlation_id());
        let req = request.into_inner();

        METRICS.active_connections.inc();
        let result = async {
            validate(&req)?;
            run_contained(method, &ctx, handler(ctx.clone(), req)).await
        }
        .instrument(span)
        .await;
        METRICS.active_connections.dec();

        self.record(method, ctx.elapsed(), &result);
        result.map(Response::new).map_err(map_gateway_error_to_status)
    }

    /// Wrap a streaming operation. Message tallies are recorded by the
    /// stream worker itself; this wrapper owns lifecycle metrics and
    /// panic containment. The stream's cancellation chains off `parent`
    /// so graceful shutdown can ask all streams to close.
    pub async fn stream<H, Fut>(
        &self,
        method: &'static str,
        parent: &tokio_util::sync::CancellationToken,
        handler: H,
    ) -> Result<(), Status>
    where
        H: FnOnce(OpContext) -> Fut,
        Fut: std::future::Future<Output = GatewayResult<()>> + Send,
    {
        // Streams live as long as the device stays attached; the default
        // unary deadline does not apply.
        let ctx = OpContext::background(parent);
        let span = info_span!("stream", method, correlation_id = %ctx.correlation_id());

        METRICS.active_connections.inc();
        let result = run_contained(method, &ctx, handler(ctx.clone()))
            .instrument(span)
            .await;
        METRICS.active_connections.dec();

        self.record(method, ctx.elapsed(), &result);
        result.map_err(map_gateway_error_to_status)
    }

    fn record<T>(&self, method: &'static str, elapsed: Duration, result: &GatewayResult<T>) {
        let code = match result {
            Ok(_) => Code::Ok,
            Err(err) => status_code_for(err),
        };
        let code_label = format!("{code:?}");
        METRICS
            .requests_total
            .with_label_values(&[method, &code_label])
            .inc();
        METRICS
            .request_duration_seconds
            .with_label_values(&[method, &code_label])
            .observe(elapsed.as_secs_f64());
    }
}

/// Run the handler with panic containment.
async fn run_contained<T, Fut>(
    method: &'static str,
    ctx: &OpContext,
    fut: Fut,
) -> GatewayResult<T>
where
    Fut: std::future::Future<Output = GatewayResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            METRICS.panics_total.with_label_values(&[method]).inc();
            error!(
                method,
                correlation_id = ctx.correlation_id(),
                panic = %message,
                "handler panicked"
            );
            Err(categorize_panic(&message))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Categorizable overrides: panics that clearly originate in validation
/// or persistence code get the matching caller-visible category instead
/// of a blanket `Internal`.
fn categorize_panic(message: &str) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("validation") || lower.contains("invalid") {
        GatewayError::validation("request validation failed")
    } else if lower.contains("database") || lower.contains("sql") || lower.contains("connection") {
        GatewayError::unavailable_transient("persistence temporarily unavailable")
    } else {
        GatewayError::Internal(format!("contained panic: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::new(None)
    }

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let response = pipeline()
            .unary(
                "Echo",
                Request::new(41),
                |_req| Ok(()),
                |_ctx, req: i32| async move { Ok(req + 1) },
            )
            .await
            .unwrap();
        assert_eq!(response.into_inner(), 42);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_handler_runs() {
        let status = pipeline()
            .unary(
                "Echo",
                Request::new(0),
                |_req| Err(GatewayError::validation("nope")),
                |_ctx, _req: i32| async move {
                    if _req == 0 {
                        panic!("handler must not run");
                    }
                    Ok(0)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "nope");
    }

    #[tokio::test]
    async fn test_panic_contained_as_internal() {
        let status = pipeline()
            .unary(
                "Echo",
                Request::new(0),
                |_req| Ok(()),
                |_ctx, _req: i32| async move {
                    if _req == 0 {
                        panic!("boom");
                    }
                    Ok(0)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_persistence_flavored_panic_maps_to_unavailable() {
        let status = pipeline()
            .unary(
                "Echo",
                Request::new(0),
                |_req| Ok(()),
                |_ctx, _req: i32| async move {
                    if _req == 0 {
                        panic!("database connection refused");
                    }
                    Ok(0)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_validation_flavored_panic_maps_to_invalid_argument() {
        let status = pipeline()
            .unary(
                "Echo",
                Request::new(0),
                |_req| Ok(()),
                |_ctx, _req: i32| async move {
                    if _req == 0 {
                        panic!("invalid field encoding");
                    }
                    Ok(0)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_deadline_surfaces_as_deadline_exceeded() {
        let pipeline = Pipeline::new(Some(Duration::from_millis(20)));
        let status = pipeline
            .unary(
                "Slow",
                Request::new(0),
                |_req| Ok(()),
                |ctx, _req: i32| async move {
                    ctx.run(async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(0)
                    })
                    .await
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }
}
