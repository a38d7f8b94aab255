// src/error.rs
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use crate::credential::CredentialError;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// Why a request failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingToken,
    Expired,
    Invalid,
    UnknownDevice,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthenticated: {0:?}")]
    Unauthenticated(AuthFailure),
    #[error("payload device_id does not match token")]
    IdentityMismatch,
    #[error("device {device_id} is not assigned to patient {patient_id}")]
    NotAssigned {
        device_id: String,
        patient_id: String,
    },
    #[error("device {0} is already registered")]
    DeviceExists(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::IdentityMismatch | ApiError::NotAssigned { .. } => StatusCode::FORBIDDEN,
            ApiError::DeviceExists(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::StorageFailure(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated(AuthFailure::MissingToken) => "AUTH_REQUIRED",
            ApiError::Unauthenticated(AuthFailure::Expired) => "TOKEN_EXPIRED",
            ApiError::Unauthenticated(AuthFailure::Invalid) => "TOKEN_INVALID",
            ApiError::Unauthenticated(AuthFailure::UnknownDevice) => "DEVICE_UNKNOWN",
            ApiError::IdentityMismatch => "IDENTITY_MISMATCH",
            ApiError::NotAssigned { .. } => "NOT_ASSIGNED",
            ApiError::DeviceExists(_) => "DEVICE_EXISTS",
            ApiError::Validation(_) => "VALIDATION",
            ApiError::StorageFailure(_) | ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthenticated(AuthFailure::MissingToken) => "Bearer token required".into(),
            ApiError::Unauthenticated(AuthFailure::Expired) => "Token expired, re-register".into(),
            ApiError::Unauthenticated(AuthFailure::Invalid) => "Invalid token".into(),
            ApiError::Unauthenticated(AuthFailure::UnknownDevice) => "Device not registered".into(),
            ApiError::IdentityMismatch => "Device ID mismatch".into(),
            ApiError::NotAssigned { .. } => "Device not assigned to patient".into(),
            ApiError::StorageFailure(_) | ApiError::Internal(_) => {
                "An internal error occurred".into()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(code = self.code(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.message(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Expired => ApiError::Unauthenticated(AuthFailure::Expired),
            CredentialError::Malformed => ApiError::Unauthenticated(AuthFailure::Invalid),
            CredentialError::SigningUnavailable => {
                ApiError::Internal("this instance holds no signing key".into())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::StorageFailure(err.to_string())
    }
}
