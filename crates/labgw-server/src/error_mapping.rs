//! Semantic mapping from `GatewayError` to gRPC `Status` codes.
//!
//! # Mapping Philosophy
//!
//! - **InvalidArgument**: the caller sent input the gateway rejects
//! - **NotFound / AlreadyExists**: entity lookups and unique violations
//! - **FailedPrecondition**: system state does not allow the operation
//!   (e.g. a stream attaching without an active registration)
//! - **ResourceExhausted**: queue or rate limits
//! - **Cancelled / DeadlineExceeded**: caller cancellation
//! - **Unavailable**: persistence or dependency outage; retryable
//! - **Unauthenticated / PermissionDenied**: credential failures
//! - **Internal**: contained panics and invariant breaches

use labgw_core::GatewayError;
use tonic::{Code, Status};

/// The status code an error will map to, without building the `Status`.
/// Used by the pipeline for metric labels.
pub fn status_code_for(err: &GatewayError) -> Code {
    match err {
        GatewayError::Validation(_) => Code::InvalidArgument,
        GatewayError::NotFound(_) => Code::NotFound,
        GatewayError::AlreadyExists(_) => Code::AlreadyExists,
        GatewayError::FailedPrecondition(_) => Code::FailedPrecondition,
        GatewayError::ResourceExhausted(_) => Code::ResourceExhausted,
        GatewayError::DeadlineExceeded => Code::DeadlineExceeded,
        GatewayError::Cancelled => Code::Cancelled,
        GatewayError::Unavailable { .. } => Code::Unavailable,
        GatewayError::Unauthenticated(_) => Code::Unauthenticated,
        GatewayError::PermissionDenied(_) => Code::PermissionDenied,
        GatewayError::Internal(_) => Code::Internal,
    }
}

/// Map a gateway error to an appropriate gRPC status.
pub fn map_gateway_error_to_status(err: GatewayError) -> Status {
    match err {
        GatewayError::Validation(msg) => Status::new(Code::InvalidArgument, msg),
        GatewayError::NotFound(entity) => {
            Status::new(Code::NotFound, format!("{entity} not found"))
        }
        GatewayError::AlreadyExists(entity) => {
            Status::new(Code::AlreadyExists, format!("{entity} already exists"))
        }
        GatewayError::FailedPrecondition(msg) => Status::new(Code::FailedPrecondition, msg),
        GatewayError::ResourceExhausted(msg) => Status::new(Code::ResourceExhausted, msg),
        GatewayError::DeadlineExceeded => {
            Status::new(Code::DeadlineExceeded, "operation deadline exceeded")
        }
        GatewayError::Cancelled => Status::new(Code::Cancelled, "operation cancelled"),
        GatewayError::Unavailable { message, .. } => Status::new(Code::Unavailable, message),
        GatewayError::Unauthenticated(msg) => Status::new(Code::Unauthenticated, msg),
        GatewayError::PermissionDenied(msg) => Status::new(Code::PermissionDenied, msg),
        GatewayError::Internal(_) => {
            // Never leak internal details to callers.
            Status::new(Code::Internal, "internal server error occurred")
        }
    }
}

/// Extension trait for converting `Result<T, GatewayError>` into
/// `Result<T, Status>`.
pub trait GatewayResultExt<T> {
    fn map_gateway_err(self) -> Result<T, Status>;
}

impl<T> GatewayResultExt<T> for Result<T, GatewayError> {
    fn map_gateway_err(self) -> Result<T, Status> {
        self.map_err(map_gateway_error_to_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_invalid_argument() {
        let status = map_gateway_error_to_status(GatewayError::validation("device_id is required"));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "device_id is required");
    }

    #[test]
    fn test_cancellation_codes() {
        assert_eq!(
            map_gateway_error_to_status(GatewayError::Cancelled).code(),
            Code::Cancelled
        );
        assert_eq!(
            map_gateway_error_to_status(GatewayError::DeadlineExceeded).code(),
            Code::DeadlineExceeded
        );
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let status =
            map_gateway_error_to_status(GatewayError::Internal("secret pool address".into()));
        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("secret"));
    }

    #[test]
    fn test_unavailable_preserves_message() {
        let status = map_gateway_error_to_status(GatewayError::unavailable_transient(
            "database connect refused",
        ));
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().contains("database"));
    }
}
