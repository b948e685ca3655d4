use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

pub const INTERNAL_MESSAGE: &str = "Internal server error. See log for details.";

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub missing_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
}

/// HTTP-facing error taxonomy shared by every handler and gate.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed or unparseable input (422).
    Validation { code: &'static str, message: Option<String> },
    /// Missing, invalid or expired credential (401). Message is always generic.
    Unauthenticated { message: &'static str },
    /// Known principal lacking the named role (403).
    ForbiddenMissingRole { role: String, trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    Conflict { code: &'static str, message: String },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    /// Dependency failure (500). Detail stays in the server log.
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    /// Logs `e` with a fresh trace id and returns a generic 500 carrying that id.
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        let trace_id = Uuid::new_v4();
        tracing::error!(%trace_id, error = %e, "internal error");
        Self::Internal { trace_id: Some(trace_id), message: Some(INTERNAL_MESSAGE.to_string()) }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { code, message: Some(message.into()) }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict { code, message: message.into() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenMissingRole { .. } | ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(error = %rejection.body_text(), "rejected request body");
        ApiError::Validation {
            code: "unparsable_input",
            message: Some("Error parsing input.".to_string()),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        tracing::debug!(error = %rejection.body_text(), "rejected path parameters");
        ApiError::Validation {
            code: "unparsable_path",
            message: Some("Error parsing path parameters.".to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (body, error_code) = match self {
            ApiError::Validation { code, message } => (
                ErrorBody { code: code.into(), missing_role: None, trace_id: None, message },
                code
            ),
            ApiError::Unauthenticated { message } => (
                ErrorBody { code: "unauthenticated".into(), missing_role: None, trace_id: None, message: Some(message.into()) },
                "unauthenticated"
            ),
            ApiError::ForbiddenMissingRole { role, trace_id } => (
                ErrorBody { code: "missing_role".into(), missing_role: Some(role), trace_id, message: None },
                "missing_role"
            ),
            ApiError::Forbidden { trace_id } => (
                ErrorBody { code: "forbidden".into(), missing_role: None, trace_id, message: None },
                "forbidden"
            ),
            ApiError::Conflict { code, message } => (
                ErrorBody { code: code.into(), missing_role: None, trace_id: None, message: Some(message) },
                code
            ),
            ApiError::NotFound { code, trace_id } => (
                ErrorBody { code: code.into(), missing_role: None, trace_id, message: None },
                code
            ),
            ApiError::Internal { trace_id, message } => (
                ErrorBody { code: "internal_error".into(), missing_role: None, trace_id, message },
                "internal_error"
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
