//! Admission and liveness supervisor.
//!
//! One background task with cooperative scheduling. Each tick it:
//! 1. demotes registry entries without a recent heartbeat,
//! 2. evicts entries offline past the stale horizon and deactivates
//!    their durable session rows,
//! 3. persists `offline` for demoted devices and raises deduplicated
//!    `device_offline` alerts,
//! 4. times out expired commands and raises `command_timeout` alerts,
//! 5. makes sure upcoming measurement partitions exist.
//!
//! The registry lock is only held inside `sweep`; all persistence work
//! happens afterwards with the collected ids. Failures are logged and
//! never propagate to callers; persistence being down during a tick
//! raises a `system_health` alert instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use labgw_core::config::LifecycleConfig;
use labgw_core::model::{Alert, AlertSeverity, AlertType, DeviceStatus};
use labgw_core::{GatewayError, OpContext};
use labgw_storage::measurement::partition_months;
use labgw_storage::{AlertFilter, Filter, RepositoryManager};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::METRICS;
use crate::registry::SessionRegistry;

pub struct LivenessSupervisor {
    repos: Arc<dyn RepositoryManager>,
    registry: Arc<SessionRegistry>,
    config: LifecycleConfig,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LivenessSupervisor {
    pub fn new(
        repos: Arc<dyn RepositoryManager>,
        registry: Arc<SessionRegistry>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            repos,
            registry,
            config,
            token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Start the periodic loop. Idempotent start is a programming error;
    /// the supervisor is started exactly once by the service.
    pub fn start(&mut self) {
        let repos = self.repos.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let token = self.token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.cleanup_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = config.cleanup_interval_secs,
                heartbeat_timeout_secs = config.heartbeat_timeout_secs,
                "liveness supervisor started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("liveness supervisor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        run_tick(&repos, &registry, &config, &token).await;
                    }
                }
            }
        });
        self.handle = Some(handle);
    }

    /// Run one supervisor pass immediately. Used by the service during
    /// startup (to seed partitions) and by tests to drive ticks without
    /// waiting on the interval.
    pub async fn tick_now(&self) {
        run_tick(&self.repos, &self.registry, &self.config, &self.token).await;
    }

    /// Signal the loop to stop and wait for the current tick to finish,
    /// up to `timeout` before giving up and aborting.
    pub async fn stop(&mut self, timeout: Duration) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => info!("liveness supervisor stopped"),
                Err(_) => warn!("liveness supervisor did not stop within timeout"),
            }
        }
    }
}

/// One supervisor pass. Public within the crate so tests can drive ticks
/// directly without waiting on the interval.
pub(crate) async fn run_tick(
    repos: &Arc<dyn RepositoryManager>,
    registry: &Arc<SessionRegistry>,
    config: &LifecycleConfig,
    token: &CancellationToken,
) {
    let ctx = OpContext::background(token);
    let mut persistence_down = false;

    // Steps 1-2: collect under the registry lock, no I/O held.
    let (demoted, evicted_sessions) = registry.sweep(config.stale_connection_horizon()).await;

    for session in &evicted_sessions {
        if let Err(err) = repos
            .session()
            .deactivate(&ctx, &session.session_id, "stale connection evicted")
            .await
        {
            persistence_down |= err.is_transient();
            warn!(session_id = %session.session_id, error = %err, "session deactivation failed");
        }
    }

    // Step 3: demoted devices go offline, with one unresolved
    // device_offline alert apiece.
    for device_id in &demoted {
        if let Err(err) = repos
            .device()
            .update_status(&ctx, device_id, DeviceStatus::Offline)
            .await
        {
            persistence_down |= err.is_transient();
            warn!(device_id, error = %err, "failed to persist offline status");
        }
        match has_open_offline_alert(repos, &ctx, device_id).await {
            Ok(true) => {}
            Ok(false) => {
                let alert = Alert::new(
                    Some(device_id.clone()),
                    AlertType::DeviceOffline,
                    AlertSeverity::Warning,
                    format!("device {device_id} missed heartbeats and was marked offline"),
                );
                if let Err(err) = repos.alert().create(&ctx, &alert).await {
                    persistence_down |= err.is_transient();
                    warn!(device_id, error = %err, "failed to raise device_offline alert");
                }
            }
            Err(err) => {
                persistence_down |= err.is_transient();
                warn!(device_id, error = %err, "failed to check for existing alert");
            }
        }
    }

    // Step 4: expired commands become timeouts, each with an alert.
    match repos.command().mark_expired_as_timeout(&ctx).await {
        Ok(expired) => {
            for command in &expired {
                let alert = Alert::new(
                    Some(command.device_id.clone()),
                    AlertType::CommandTimeout,
                    AlertSeverity::Error,
                    format!(
                        "command {} ({}) expired before the device replied",
                        command.command_id, command.command_type
                    ),
                );
                if let Err(err) = repos.alert().create(&ctx, &alert).await {
                    persistence_down |= err.is_transient();
                    warn!(command_id = %command.command_id, error = %err,
                        "failed to raise command_timeout alert");
                }
            }
            if !expired.is_empty() {
                info!(count = expired.len(), "expired commands marked as timeout");
            }
        }
        Err(err) => {
            persistence_down |= err.is_transient();
            warn!(error = %err, "mark_expired_as_timeout failed");
        }
    }

    // Step 5: measurement partitions ahead of the write frontier.
    for (year, month) in partition_months(Utc::now(), config.partition_lookahead_months) {
        if let Err(err) = repos.measurement().ensure_partition(&ctx, year, month).await {
            persistence_down |= err.is_transient();
            warn!(year, month, error = %err, "failed to ensure measurement partition");
        }
    }

    if persistence_down {
        raise_system_health_alert(repos, &ctx).await;
        METRICS
            .supervisor_ticks_total
            .with_label_values(&["degraded"])
            .inc();
    } else {
        METRICS
            .supervisor_ticks_total
            .with_label_values(&["ok"])
            .inc();
    }
    if !demoted.is_empty() || !evicted_sessions.is_empty() {
        debug!(
            demoted = demoted.len(),
            evicted = evicted_sessions.len(),
            "supervisor tick completed"
        );
    }
}

/// True when the device already has an unresolved device_offline alert.
async fn has_open_offline_alert(
    repos: &Arc<dyn RepositoryManager>,
    ctx: &OpContext,
    device_id: &str,
) -> Result<bool, GatewayError> {
    let filter = AlertFilter {
        filter: Filter {
            limit: 1,
            ..Filter::default()
        },
        device_ids: vec![device_id.to_string()],
        types: vec![AlertType::DeviceOffline],
        resolved: Some(false),
        ..AlertFilter::default()
    };
    Ok(repos.alert().count(ctx, &filter).await? > 0)
}

async fn raise_system_health_alert(repos: &Arc<dyn RepositoryManager>, ctx: &OpContext) {
    let alert = Alert::new(
        None,
        AlertType::SystemHealth,
        AlertSeverity::Error,
        "persistence unavailable during supervisor pass".to_string(),
    );
    if let Err(err) = repos.alert().create(ctx, &alert).await {
        error!(error = %err, "failed to raise system_health alert");
    }
}
