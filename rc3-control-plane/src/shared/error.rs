use rc3_core::{CoreError, ErrorCode};
use thiserror::Error;

/// Control plane specific errors
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("Upstream unavailable while attempting to {step}: {message}")]
    UpstreamUnavailable { step: String, message: String },
    #[error("No capacity: {0}")]
    NoCapacity(String),
    #[error("Instance id {0} was claimed by another request; allocation retries exhausted")]
    AllocationConflict(u64),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ControlPlaneError {
    pub fn upstream(step: impl Into<String>, error: impl std::fmt::Display) -> Self {
        ControlPlaneError::UpstreamUnavailable {
            step: step.into(),
            message: error.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ControlPlaneError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ControlPlaneError::NotFound(_) => ErrorCode::NotFound,
            ControlPlaneError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ControlPlaneError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            ControlPlaneError::UpstreamUnavailable { .. } => ErrorCode::UpstreamUnavailable,
            ControlPlaneError::NoCapacity(_) => ErrorCode::NoCapacity,
            ControlPlaneError::AllocationConflict(_) => ErrorCode::AllocationConflict,
            ControlPlaneError::Unsupported(_) => ErrorCode::Unsupported,
        }
    }
}

impl From<CoreError> for ControlPlaneError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidSize(_) | CoreError::InvalidKind(_) | CoreError::InvalidOwner(_) => {
                ControlPlaneError::InvalidRequest(err.to_string())
            }
            CoreError::NoNodesAvailable => ControlPlaneError::NoCapacity(err.to_string()),
        }
    }
}

impl From<ControlPlaneError> for rc3_core::ErrorResponse {
    fn from(err: ControlPlaneError) -> Self {
        let message = match &err {
            ControlPlaneError::InvalidRequest(msg)
            | ControlPlaneError::NotFound(msg)
            | ControlPlaneError::PermissionDenied(msg)
            | ControlPlaneError::Unauthenticated(msg)
            | ControlPlaneError::NoCapacity(msg)
            | ControlPlaneError::Unsupported(msg) => msg.clone(),
            ControlPlaneError::UpstreamUnavailable { step, message } => {
                format!("could not {step}: {message}")
            }
            ControlPlaneError::AllocationConflict(_) => err.to_string(),
        };

        rc3_core::ErrorResponse::new(err.code(), message)
    }
}

pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_error_creation() {
        let err = ControlPlaneError::InvalidRequest("test".to_string());
        assert!(err.to_string().contains("Invalid request"));
    }

    #[test]
    fn test_upstream_error_names_step() {
        let err = ControlPlaneError::upstream("list nodes", "connection refused");
        assert_eq!(
            err.to_string(),
            "Upstream unavailable while attempting to list nodes: connection refused"
        );
        assert_eq!(err.code(), ErrorCode::UpstreamUnavailable);
    }

    #[test]
    fn test_core_error_mapping() {
        let err: ControlPlaneError = CoreError::InvalidSize("xl".to_string()).into();
        assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));

        let err: ControlPlaneError = CoreError::NoNodesAvailable.into();
        assert!(matches!(err, ControlPlaneError::NoCapacity(_)));
    }

    #[test]
    fn test_control_plane_error_conversion_to_error_response() {
        let err = ControlPlaneError::PermissionDenied("not yours".to_string());
        let error_response: rc3_core::ErrorResponse = err.into();
        assert_eq!(error_response.error_code, ErrorCode::PermissionDenied);
        assert_eq!(error_response.message, "not yours");
    }

    #[test]
    fn test_upstream_error_response_message() {
        let err = ControlPlaneError::upstream("allocate id", "503 Service Unavailable");
        let error_response: rc3_core::ErrorResponse = err.into();
        assert_eq!(error_response.error_code, ErrorCode::UpstreamUnavailable);
        assert_eq!(
            error_response.message,
            "could not allocate id: 503 Service Unavailable"
        );
    }

    #[test]
    fn test_control_plane_result_type() {
        type TestResult = ControlPlaneResult<String>;
        let ok: TestResult = Ok("success".to_string());
        let err: TestResult = Err(ControlPlaneError::Unsupported("vm".to_string()));

        assert!(ok.is_ok());
        assert_eq!(err.unwrap_err().to_string(), "Unsupported: vm");
    }
}
