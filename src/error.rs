use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The error kinds a Terrapod API response can surface. Each one maps to a
/// fixed HTTP status; callers match on the variant, never the message text.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found")]
    NotFound,
    #[error("illegal transition: {0}")]
    IllegalTransition(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("encryption key missing")]
    EncryptionKeyMissing,
    #[error("corrupt ciphertext")]
    CorruptCiphertext,
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::UpstreamFailure(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::UpstreamFailure(err.to_string())
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::IllegalTransition(_) | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PermissionDenied => StatusCode::FORBIDDEN,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::EncryptionKeyMissing | AppError::CorruptCiphertext => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::IllegalTransition(_) => "illegal_transition",
            AppError::Conflict(_) => "conflict",
            AppError::PermissionDenied => "permission_denied",
            AppError::Unauthenticated => "unauthenticated",
            AppError::ValidationError(_) => "validation_error",
            AppError::EncryptionKeyMissing => "encryption_key_missing",
            AppError::CorruptCiphertext => "corrupt_ciphertext",
            AppError::UpstreamFailure(_) => "upstream_failure",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "request rejected");
        }
        let body = json!({
            "errors": [{
                "status": status.as_u16().to_string(),
                "code": self.kind(),
                "title": self.to_string(),
            }]
        });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
