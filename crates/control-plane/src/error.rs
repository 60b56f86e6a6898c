use axum::http::StatusCode;
use sqlx::{Error as SqlxError, error::DatabaseError};
use tracing::error;

/// Error returned by services and HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const DB_UNAVAILABLE_MESSAGE: &str = "database temporarily unavailable";

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn conflict(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, msg)
    }

    pub fn bad_gateway(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, msg)
    }

    pub fn gateway_timeout(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
    }

    /// A task or ledger write failed after the node call itself resolved.
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Busy,
}

fn find_sqlx_error(err: &anyhow::Error) -> Option<&SqlxError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
}

fn map_sqlx_error(err: &SqlxError) -> Option<AppError> {
    match err {
        SqlxError::RowNotFound => Some(AppError::not_found("resource not found")),
        SqlxError::Database(db_err) => map_database_error(db_err.as_ref()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
        }
        _ => None,
    }
}

fn map_database_error(err: &dyn DatabaseError) -> Option<AppError> {
    let kind = classify_db_error(err.code().as_deref(), err.message())?;
    let mapped = match kind {
        DbErrorKind::UniqueViolation => AppError::bad_request("resource already exists"),
        DbErrorKind::ForeignKeyViolation => AppError::bad_request("invalid reference"),
        DbErrorKind::NotNullViolation => AppError::bad_request("missing required field"),
        DbErrorKind::CheckViolation => AppError::bad_request("invalid request"),
        DbErrorKind::Busy => AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE),
    };
    Some(mapped)
}

// SQLite extended result codes, with message fallbacks for wrapped errors.
fn classify_db_error(code: Option<&str>, message: &str) -> Option<DbErrorKind> {
    let code = code.unwrap_or_default();
    let message = message.to_ascii_lowercase();

    if matches!(code, "2067" | "1555") || message.contains("unique constraint") {
        return Some(DbErrorKind::UniqueViolation);
    }
    if code == "787" || message.contains("foreign key constraint") {
        return Some(DbErrorKind::ForeignKeyViolation);
    }
    if code == "1299" || message.contains("not null constraint") {
        return Some(DbErrorKind::NotNullViolation);
    }
    if code == "275" || message.contains("check constraint") {
        return Some(DbErrorKind::CheckViolation);
    }
    if matches!(code, "5" | "6" | "517")
        || message.contains("database is locked")
        || message.contains("database is busy")
    {
        return Some(DbErrorKind::Busy);
    }
    None
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match find_sqlx_error(err) {
        Some(SqlxError::Database(db_err)) => matches!(
            classify_db_error(db_err.code().as_deref(), db_err.message()),
            Some(DbErrorKind::UniqueViolation)
        ),
        _ => false,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mapped) = find_sqlx_error(&err).and_then(map_sqlx_error) {
            if mapped.status.is_server_error() {
                crate::telemetry::record_internal_error_metrics(&err);
                error!(?err, "database unavailable");
            }
            return mapped;
        }

        crate::telemetry::record_internal_error_metrics(&err);
        error!(?err, "internal error");
        AppError::internal("internal server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_constraint_failures() {
        assert_eq!(
            classify_db_error(Some("2067"), "UNIQUE constraint failed: users.email"),
            Some(DbErrorKind::UniqueViolation)
        );
        assert_eq!(
            classify_db_error(None, "FOREIGN KEY constraint failed"),
            Some(DbErrorKind::ForeignKeyViolation)
        );
        assert_eq!(
            classify_db_error(None, "NOT NULL constraint failed: tasks.node_id"),
            Some(DbErrorKind::NotNullViolation)
        );
        assert_eq!(
            classify_db_error(Some("275"), "CHECK constraint failed: status"),
            Some(DbErrorKind::CheckViolation)
        );
    }

    #[test]
    fn classify_detects_busy_database() {
        assert_eq!(
            classify_db_error(Some("5"), "database is locked"),
            Some(DbErrorKind::Busy)
        );
        assert_eq!(classify_db_error(None, "syntax error"), None);
    }

    #[test]
    fn pool_timeout_maps_to_service_unavailable() {
        let err = AppError::from(anyhow::Error::new(SqlxError::PoolTimedOut));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "service_unavailable");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = AppError::from(anyhow::Error::new(SqlxError::RowNotFound));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "resource not found");
    }

    #[test]
    fn unknown_errors_are_hidden() {
        let err = AppError::from(anyhow::anyhow!("secret detail"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal server error");
    }
}
