use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the accounting pipeline (spec §7). These are
/// categories, not a 1:1 mapping of every failure site — fetchers and the
/// updater mostly propagate `anyhow::Error` and only get classified here at
/// boundaries that must decide "fatal to the process" vs "log and continue
/// to the next tick".
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("external endpoint unreachable: {0}")]
    ExternalUnreachable(String),

    #[error("malformed response from external service: {0}")]
    ExternalMalformed(String),

    #[error("tick deadline exceeded: {0}")]
    TransientTimeout(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    InternalServerError(String),
}

impl AppError {
    /// Config and database-write errors are fatal at startup / schema level;
    /// everything else is recovered by the scheduler and logged (spec §7).
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::DatabaseError(_))
    }
}

/// Helper for mapping any unknown error into an internal error.
pub fn internal_error<E: ToString>(err: E) -> AppError {
    AppError::InternalServerError(err.to_string())
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ExternalUnreachable(_) => StatusCode::BAD_GATEWAY,
            AppError::ExternalMalformed(_) => StatusCode::BAD_GATEWAY,
            AppError::TransientTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}

/// Process exit codes (spec §6).
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_VALIDATION_FAILURE: i32 = 1;
    pub const DATABASE_OPEN_FAILURE: i32 = 2;
    pub const FATAL_WRITE_ERROR: i32 = 3;
}
