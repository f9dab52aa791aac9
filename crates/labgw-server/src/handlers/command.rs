//! Command submission and acknowledgment.
//!
//! `send_command` persists the command in `pending`; delivery is the
//! stream egress's job. Device acknowledgments arrive back through the
//! stream and land here for the terminal transition.

use std::sync::Arc;

use labgw_core::limits;
use labgw_core::model::{validate_device_id, Command, CommandResult, CommandStatus, Metadata};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use labgw_proto::convert::metadata_from_wire;
use labgw_proto::wire::{self, CommandAckFrame, SendCommandRequest, SendCommandResponse};
use labgw_storage::RepositoryManager;
use tracing::info;

pub struct CommandHandler {
    repos: Arc<dyn RepositoryManager>,
}

pub fn validate_request(req: &SendCommandRequest) -> GatewayResult<()> {
    validate_device_id(&req.device_id)?;
    if req.r#type.trim().is_empty() {
        return Err(GatewayError::validation("command type is required"));
    }
    if req.timeout_seconds <= 0 {
        return Err(GatewayError::validation("timeout_seconds must be positive"));
    }
    if req.timeout_seconds > limits::MAX_COMMAND_TIMEOUT_SECS {
        return Err(GatewayError::validation(format!(
            "timeout_seconds too large (max {})",
            limits::MAX_COMMAND_TIMEOUT_SECS
        )));
    }
    Ok(())
}

impl CommandHandler {
    pub fn new(repos: Arc<dyn RepositoryManager>) -> Self {
        Self { repos }
    }

    /// Persist a command in `pending` with `expires_at = now + timeout`.
    /// The device does not need to be connected; the command waits for
    /// the next stream attachment until it expires.
    pub async fn send_command(
        &self,
        ctx: &OpContext,
        req: SendCommandRequest,
    ) -> GatewayResult<SendCommandResponse> {
        self.repos
            .device()
            .get_by_id(ctx, &req.device_id)
            .await?
            .ok_or(GatewayError::NotFound("device"))?;

        let priority = if req.priority == 0 { 1 } else { req.priority };
        let command = Command::new(
            &req.device_id,
            req.r#type.trim(),
            metadata_from_wire(&req.parameters),
            priority,
            req.timeout_seconds,
        );
        self.repos.command().create(ctx, &command).await?;

        info!(
            correlation_id = ctx.correlation_id(),
            device_id = %req.device_id,
            command_id = %command.command_id,
            r#type = %command.command_type,
            "command submitted"
        );

        Ok(SendCommandResponse {
            command_id: command.command_id,
            status: wire::CommandStatus::CommandStatusPending as i32,
            message: "Command queued for delivery".to_string(),
        })
    }

    /// Apply a device acknowledgment: `executing -> completed | failed`.
    pub async fn handle_ack(&self, ctx: &OpContext, ack: &CommandAckFrame) -> GatewayResult<()> {
        let mut command = self
            .repos
            .command()
            .get_by_command_id(ctx, &ack.command_id)
            .await?
            .ok_or(GatewayError::NotFound("command"))?;

        if command.status != CommandStatus::Executing {
            // Late or duplicate ack; terminal states never regress.
            return Err(GatewayError::FailedPrecondition(format!(
                "command {} is {} and cannot accept a result",
                ack.command_id, command.status
            )));
        }

        let data: Metadata = ack
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        command.complete_execution(CommandResult {
            success: ack.success,
            message: ack.message.clone(),
            data,
        });
        self.repos.command().update(ctx, &command).await?;

        info!(
            command_id = %ack.command_id,
            success = ack.success,
            execution_time_ms = command.execution_time_ms,
            "command acknowledged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request() -> SendCommandRequest {
        SendCommandRequest {
            device_id: "d1".into(),
            r#type: "calibrate".into(),
            parameters: HashMap::from([("mode".to_string(), "auto".to_string())]),
            priority: 0,
            timeout_seconds: 30,
        }
    }

    #[test]
    fn test_validate_accepts_good_request() {
        assert!(validate_request(&request()).is_ok());
    }

    #[test]
    fn test_timeout_bounds_rejected() {
        let mut req = request();
        req.timeout_seconds = 0;
        assert!(validate_request(&req).is_err());

        req.timeout_seconds = -5;
        assert!(validate_request(&req).is_err());

        req.timeout_seconds = 3601;
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_empty_type_rejected() {
        let mut req = request();
        req.r#type = "  ".into();
        assert!(validate_request(&req).is_err());
    }
}
