//! Per-operation context: correlation, cancellation, deadline.
//!
//! Every caller-facing operation is wrapped by the request pipeline, which
//! allocates an [`OpContext`] and threads it through all downstream calls.
//! Repositories and services observe the context at their natural
//! suspension points so that a disconnecting caller or an expired deadline
//! stops work promptly instead of running it to completion.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

/// Context carried through a single logical operation.
///
/// Cloning is cheap; clones share the same cancellation token, so
/// cancelling any clone cancels the whole operation tree.
#[derive(Debug, Clone)]
pub struct OpContext {
    correlation_id: String,
    token: CancellationToken,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Create a context with a fresh correlation id and no deadline.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
            started_at: Instant::now(),
            deadline: None,
        }
    }

    /// Create a context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::new();
        ctx.deadline = Some(ctx.started_at + timeout);
        ctx
    }

    /// Context for background work (supervisor ticks). Carries its own
    /// correlation id so log lines from one tick can be grouped.
    pub fn background(parent: &CancellationToken) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            token: parent.child_token(),
            started_at: Instant::now(),
            deadline: None,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wall-clock time spent in this operation so far.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Request cancellation of this operation and everything spawned on
    /// its behalf.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Non-blocking check, called at operation entry and between steps.
    pub fn check(&self) -> GatewayResult<()> {
        if self.token.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(GatewayError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run a future under this context's cancellation and deadline.
    ///
    /// The inner future is dropped at its next suspension point when the
    /// token fires or the deadline passes.
    pub async fn run<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: std::future::Future<Output = GatewayResult<T>>,
    {
        match self.deadline {
            Some(deadline) => {
                let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                tokio::select! {
                    _ = self.token.cancelled() => Err(GatewayError::Cancelled),
                    _ = sleep => Err(GatewayError::DeadlineExceeded),
                    res = fut => res,
                }
            }
            None => {
                tokio::select! {
                    _ = self.token.cancelled() => Err(GatewayError::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}
