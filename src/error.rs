//! Crate-wide error type (spec §7, "Error Handling Design").
//!
//! One `AppError` enum carries every error kind named in the spec; the HTTP
//! layer (`webhook`) maps each variant to a status code and JSON envelope.
//! Store/infra failures are wrapped rather than panicking; bot-local errors
//! are caught and logged at the update-handler boundary rather than ever
//! reaching this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Error kinds named in spec §7 (not Rust type names, but the taxonomy the
/// spec uses to describe propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or out-of-range input.
    Validation,
    /// Unknown webhook secret / unauthenticated caller.
    Authentication,
    /// Project inactive or caller lacks rights to the resource.
    Authorization,
    /// Referenced entity does not exist.
    NotFound,
    /// State conflict: insufficient balance, duplicate order, write race.
    Conflict,
    /// Caller exceeded the allowed request rate.
    RateLimited,
    /// A collaborator (Telegram, the store) failed.
    ExternalDependency,
    /// Anything else — a bug or an unrecoverable condition.
    Internal,
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Webhook secret did not match any project.
    #[error("unknown webhook secret")]
    UnknownWebhookSecret,
    /// Project exists but is not active.
    #[error("project is not active")]
    ProjectInactive,
    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Attempted to spend more than the available balance.
    #[error("insufficient bonus balance")]
    InsufficientBonuses,
    /// A unique/ordering constraint was violated by the caller's request.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller was rate limited (collaborator concern; surfaced here for
    /// HTTP mapping only, not implemented by this crate — spec §1).
    #[error("rate limited")]
    RateLimited,
    /// A downstream dependency (Telegram API, the database) failed.
    #[error("external dependency failed: {0}")]
    ExternalDependency(String),
    /// Propagated store/database error.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The taxonomy kind for this error, per spec §7.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::UnknownWebhookSecret => ErrorKind::Authentication,
            AppError::ProjectInactive => ErrorKind::Authorization,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::InsufficientBonuses | AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::RateLimited => ErrorKind::RateLimited,
            AppError::ExternalDependency(_) => ErrorKind::ExternalDependency,
            AppError::Store(e) if is_retryable(e) => ErrorKind::Conflict,
            AppError::Store(_) => ErrorKind::ExternalDependency,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// A short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::UnknownWebhookSecret => "unknown_webhook_secret",
            AppError::ProjectInactive => "project_inactive",
            AppError::NotFound(_) => "not_found",
            AppError::InsufficientBonuses => "insufficient_bonuses",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited => "rate_limited",
            AppError::ExternalDependency(_) => "external_dependency",
            AppError::Store(_) => "store_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// `true` when a [`sqlx::Error`] represents a transient write conflict that
/// should be retried at the transaction boundary rather than surfaced as a
/// permanent constraint violation (spec §4.1 "Failure").
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: ErrorKind,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ExternalDependency | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error serving request");
        } else {
            tracing::warn!(error = %self, "request failed");
        }

        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                kind: self.kind(),
                code: self.code(),
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Convenience alias used throughout the engine modules.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_bonuses_maps_to_conflict() {
        assert_eq!(AppError::InsufficientBonuses.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn unknown_secret_maps_to_authentication() {
        assert_eq!(AppError::UnknownWebhookSecret.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn inactive_project_maps_to_authorization() {
        assert_eq!(AppError::ProjectInactive.kind(), ErrorKind::Authorization);
    }
}
