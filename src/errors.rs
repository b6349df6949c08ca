use http::StatusCode;
use sea_orm::error::{DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error payload handed to whichever outer surface consumes the core.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Store failure during {operation} on {entity}: {source}")]
    StoreFailure {
        operation: &'static str,
        entity: String,
        #[source]
        source: DbErr,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::InvalidInput(err.to_string())
    }
}

impl ServiceError {
    /// Wraps a database error with the operation and entity it happened on.
    ///
    /// Unique-constraint violations are reported as [`ServiceError::Conflict`]
    /// so callers can tell a duplicate identity apart from an infrastructure fault.
    pub fn store(operation: &'static str, entity: impl Into<String>, source: DbErr) -> Self {
        let entity = entity.into();
        if let Some(SqlErr::UniqueConstraintViolation(detail)) = source.sql_err() {
            return ServiceError::Conflict(format!("{} on {}: {}", operation, entity, detail));
        }
        ServiceError::StoreFailure {
            operation,
            entity,
            source,
        }
    }

    /// Returns a closure suitable for `map_err` that wraps store errors with context.
    pub fn store_ctx(
        operation: &'static str,
        entity: impl Into<String>,
    ) -> impl FnOnce(DbErr) -> ServiceError {
        let entity = entity.into();
        move |source| ServiceError::store(operation, entity, source)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }

    /// True for errors caused by competing writers; the operation may be retried
    /// against freshly loaded state.
    pub fn is_contention(&self) -> bool {
        matches!(self, ServiceError::ConcurrentModification(_))
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::StoreFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error message suitable for client responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::StoreFailure { .. } => "Database error".to_string(),
            Self::Config(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::Timeout(_) => "Request timed out".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }

    /// Builds the client-facing error payload.
    pub fn to_response(&self) -> ErrorResponse {
        let status = self.status_code();
        ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// Result extensions for easier error handling
pub trait ResultExt<T> {
    fn map_err_to_service(self) -> Result<T, ServiceError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<ServiceError>,
{
    fn map_err_to_service(self) -> Result<T, ServiceError> {
        self.map_err(|e| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::InvalidState("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::ConcurrentModification(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::Timeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_message_hides_store_details() {
        let err = ServiceError::store(
            "update checkout",
            "checkout 42",
            DbErr::Custom("connection reset".into()),
        );
        assert_eq!(err.response_message(), "Database error");
        assert!(err.to_string().contains("update checkout"));
        assert!(err.to_string().contains("checkout 42"));

        assert_eq!(
            ServiceError::NotFound("item not in checkout".into()).response_message(),
            "Not found: item not in checkout"
        );
    }

    #[test]
    fn to_response_uses_canonical_reason() {
        let payload = ServiceError::InvalidState("checkout already completed".into()).to_response();
        assert_eq!(payload.error, "Unprocessable Entity");
        assert!(payload.message.contains("already completed"));
    }

    #[test]
    fn contention_is_only_concurrent_modification() {
        assert!(ServiceError::ConcurrentModification(Uuid::new_v4()).is_contention());
        assert!(!ServiceError::Conflict("dup".into()).is_contention());
    }
}
