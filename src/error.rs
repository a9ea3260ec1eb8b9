use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

/// A single rule/field violation, surfaced under `error.details` for
/// `VALIDATION_FAILED` responses.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationDetail {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl ViolationDetail {
    pub fn new(field: impl Into<String>, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Unified error taxonomy. Every internal operation returns `AppResult<T>`;
/// wrapping (`?`) always preserves the original variant.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("INVALID_PAYLOAD: {0}")]
    InvalidPayload(String),
    #[error("VALIDATION_FAILED: one or more fields failed validation")]
    ValidationFailed(Vec<ViolationDetail>),
    #[error("UNAUTHORIZED: {0}")]
    Unauthorized(String),
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("FILE_TOO_LARGE: {0}")]
    FileTooLarge(String),
    #[error("AI_REQUEST_FAILED: {0}")]
    AiRequestFailed(String),
    #[error("INTERNAL_ERROR: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidPayload(_) => "INVALID_PAYLOAD",
            AppError::ValidationFailed(_) => "VALIDATION_FAILED",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::FileTooLarge(_) => "FILE_TOO_LARGE",
            AppError::AiRequestFailed(_) => "AI_REQUEST_FAILED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AppError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::AiRequestFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::InvalidPayload(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::FileTooLarge(msg)
            | AppError::AiRequestFailed(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::ValidationFailed(_) => "One or more fields failed validation.".to_string(),
        }
    }

    pub fn body(&self) -> Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.message(),
        });
        if let AppError::ValidationFailed(details) = self {
            error["details"] = json!(details);
        }
        json!({ "error": error })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(code = self.code(), message = %self.message(), "request failed");
        } else {
            tracing::warn!(code = self.code(), message = %self.message(), "request rejected");
        }
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        crate::store::map_sqlx_error(error)
    }
}
