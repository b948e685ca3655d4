use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

/// Generic message shown for every authentication failure.
pub const AUTHENTICATION_FAILED: &str = "Authentication required.";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header missing")]
    MissingAuthorization,
    #[error("authorization header malformed")]
    InvalidAuthorization,
    /// Bad signature, malformed payload, wrong claim shape and expiry all collapse here.
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("principal lacks required role '{role}'")]
    Forbidden { role: String },
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::MissingAuthorization
            | AuthError::InvalidAuthorization
            | AuthError::InvalidToken => ApiError::Unauthenticated {
                message: AUTHENTICATION_FAILED,
            },
            AuthError::Forbidden { role } => ApiError::ForbiddenMissingRole {
                role,
                trace_id: None,
            },
            AuthError::Signing(_) => ApiError::internal(value),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
