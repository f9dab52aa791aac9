//! Gateway health summary: registry plus persistence.

use std::collections::HashMap;
use std::sync::Arc;

use labgw_core::{GatewayResult, OpContext};
use labgw_proto::wire::{HealthCheckRequest, HealthCheckResponse, HealthStatus};
use labgw_storage::RepositoryManager;

use crate::registry::SessionRegistry;

pub struct HealthHandler {
    repos: Arc<dyn RepositoryManager>,
    registry: Arc<SessionRegistry>,
}

impl HealthHandler {
    pub fn new(repos: Arc<dyn RepositoryManager>, registry: Arc<SessionRegistry>) -> Self {
        Self { repos, registry }
    }

    pub async fn health_check(
        &self,
        ctx: &OpContext,
        _req: HealthCheckRequest,
    ) -> GatewayResult<HealthCheckResponse> {
        let stats = self.registry.stats().await;

        let mut details = HashMap::new();
        details.insert(
            "active_connections".to_string(),
            stats.active_connections.to_string(),
        );
        details.insert(
            "total_sessions".to_string(),
            stats.total_sessions.to_string(),
        );
        details.insert(
            "messages_received".to_string(),
            stats.total_messages_received.to_string(),
        );

        let (status, message) = match self.repos.health_check(ctx).await {
            Ok(()) => {
                details.insert("database".to_string(), "ok".to_string());
                (HealthStatus::HealthServing, "serving".to_string())
            }
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                details.insert("database".to_string(), err.to_string());
                (
                    HealthStatus::HealthNotServing,
                    "persistence unavailable".to_string(),
                )
            }
        };

        Ok(HealthCheckResponse {
            status: status as i32,
            message,
            details,
        })
    }
}
