//! Device registration: the sole admission point for a device.

use std::sync::Arc;

use chrono::Utc;
use labgw_core::model::{
    validate_capabilities, validate_device_id, validate_device_name, validate_device_type,
    validate_metadata, validate_version, Device, DeviceSession, DeviceStatus,
};
use labgw_core::{GatewayResult, OpContext};
use labgw_proto::convert::{metadata_from_wire, timestamp_to_wire};
use labgw_proto::wire::{RegisterDeviceRequest, RegisterDeviceResponse};
use labgw_storage::RepositoryManager;
use tracing::{info, warn};

use crate::metrics::METRICS;
use crate::registry::SessionRegistry;

pub struct RegistrationHandler {
    repos: Arc<dyn RepositoryManager>,
    registry: Arc<SessionRegistry>,
}

/// Validate a registration request against the data-model rules.
pub fn validate_request(req: &RegisterDeviceRequest) -> GatewayResult<()> {
    validate_device_id(&req.device_id)?;
    validate_device_name(&req.name)?;
    validate_device_type(&req.r#type)?;
    validate_version(&req.version)?;
    validate_capabilities(&req.capabilities)?;
    validate_metadata(&metadata_from_wire(&req.metadata))?;
    Ok(())
}

impl RegistrationHandler {
    pub fn new(repos: Arc<dyn RepositoryManager>, registry: Arc<SessionRegistry>) -> Self {
        Self { repos, registry }
    }

    /// Register (or re-register) a device and allocate a fresh session.
    ///
    /// A persistence failure while upserting the device aborts the call;
    /// a failure while promoting the device to `online` afterwards is
    /// logged but does not fail registration, since the device row and
    /// the registry entry both exist and the next heartbeat reconciles.
    pub async fn register(
        &self,
        ctx: &OpContext,
        req: RegisterDeviceRequest,
    ) -> GatewayResult<RegisterDeviceResponse> {
        info!(
            correlation_id = ctx.correlation_id(),
            device_id = %req.device_id,
            name = %req.name,
            r#type = %req.r#type,
            "processing device registration"
        );

        let existing = self.repos.device().get_by_id(ctx, &req.device_id).await?;
        let is_update = existing.is_some();

        let device = match existing {
            Some(mut device) => {
                update_device_from_request(&mut device, &req);
                self.repos.device().update(ctx, &device).await?;
                info!(device_id = %device.id, "device registration updated");
                device
            }
            None => {
                let device = device_from_request(&req);
                self.repos.device().create(ctx, &device).await?;
                info!(device_id = %device.id, "new device registered");
                device
            }
        };

        // Allocate the session. The durable supersede and the registry
        // insert use the same unconditional-supersede policy.
        let session_id = self.registry.generate_session_id(&req.device_id);
        let mut session = DeviceSession::new(&req.device_id, &session_id);
        session.metadata = metadata_from_wire(&req.metadata);

        self.repos
            .session()
            .supersede_and_create(ctx, &session)
            .await?;
        self.registry.register(session).await;

        // Step 4: promote to online. Non-fatal on failure.
        let now = Utc::now();
        if let Err(err) = self
            .repos
            .device()
            .update_status(ctx, &device.id, DeviceStatus::Online)
            .await
        {
            warn!(device_id = %device.id, error = %err, "failed to set device online");
        }
        if let Err(err) = self.repos.device().update_last_seen(ctx, &device.id, now).await {
            warn!(device_id = %device.id, error = %err, "failed to update last seen");
        }

        METRICS
            .device_registrations_total
            .with_label_values(&[&device.device_type, "success"])
            .inc();

        let message = if is_update {
            "Device registration updated successfully"
        } else {
            "Device registered successfully"
        };
        Ok(RegisterDeviceResponse {
            success: true,
            message: message.to_string(),
            session_id,
            registered_at: Some(timestamp_to_wire(device.registered_at)),
        })
    }
}

/// Build a new device from a registration request. New devices start in
/// `connecting`; registration promotes them to `online` at the end.
fn device_from_request(req: &RegisterDeviceRequest) -> Device {
    let now = Utc::now();
    Device {
        id: req.device_id.trim().to_string(),
        name: req.name.trim().to_string(),
        device_type: req.r#type.trim().to_lowercase(),
        version: req.version.trim().to_string(),
        status: DeviceStatus::Connecting,
        metadata: metadata_from_wire(&req.metadata),
        capabilities: normalize_capabilities(&req.capabilities),
        last_seen: None,
        registered_at: now,
        created_at: now,
        updated_at: now,
    }
}

/// Merge a re-registration into an existing device. Identity and
/// registration time are immutable; a device seen again after `offline`
/// or `error` goes back to `connecting`.
fn update_device_from_request(device: &mut Device, req: &RegisterDeviceRequest) {
    device.name = req.name.trim().to_string();
    device.device_type = req.r#type.trim().to_lowercase();
    device.version = req.version.trim().to_string();
    device.updated_at = Utc::now();
    device.metadata.extend(metadata_from_wire(&req.metadata));
    if !req.capabilities.is_empty() {
        device.capabilities = normalize_capabilities(&req.capabilities);
    }
    if matches!(device.status, DeviceStatus::Offline | DeviceStatus::Error) {
        device.status = DeviceStatus::Connecting;
    }
}

fn normalize_capabilities(capabilities: &[String]) -> Vec<String> {
    capabilities
        .iter()
        .map(|c| c.trim().to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request() -> RegisterDeviceRequest {
        RegisterDeviceRequest {
            device_id: "spec-001".into(),
            name: "Spectrometer Alpha".into(),
            r#type: "Spectrometer".into(),
            version: "1.2.3".into(),
            capabilities: vec!["Spectrum".into(), "calibration".into()],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_validate_accepts_good_request() {
        assert!(validate_request(&request()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let mut req = request();
        req.device_id = "a".repeat(256);
        assert!(validate_request(&req).is_err());

        let mut req = request();
        req.capabilities.clear();
        assert!(validate_request(&req).is_err());

        let mut req = request();
        req.r#type = "hoverboard".into();
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_device_from_request_normalizes() {
        let device = device_from_request(&request());
        assert_eq!(device.device_type, "spectrometer");
        assert_eq!(device.capabilities, vec!["spectrum", "calibration"]);
        assert_eq!(device.status, DeviceStatus::Connecting);
        assert!(device.last_seen.is_none());
    }

    #[test]
    fn test_update_resets_offline_to_connecting() {
        let mut device = device_from_request(&request());
        device.status = DeviceStatus::Offline;
        update_device_from_request(&mut device, &request());
        assert_eq!(device.status, DeviceStatus::Connecting);

        device.status = DeviceStatus::Online;
        update_device_from_request(&mut device, &request());
        assert_eq!(device.status, DeviceStatus::Online);
    }
}
