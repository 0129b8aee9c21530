use chrono::{DateTime, Utc};
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors from the external LLM-backed services
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Domain errors surfaced by the learning loop engine.
///
/// Extraction failure is deliberately absent: it degrades to an empty
/// concept list and is retried opportunistically, never raised.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Loop {loop_id} is owned by a different user")]
    AccessDenied { loop_id: String },

    #[error("Usage quota exceeded (remaining: {remaining}, resets at {resets_at})")]
    QuotaExceeded {
        remaining: u32,
        resets_at: DateTime<Utc>,
    },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Evaluation failed: {message}")]
    Evaluation { message: String },

    #[error("External service failure: {0}")]
    Service(#[from] ServiceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Shorthand for a not-found error on a named entity kind.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for an invalid-state rejection.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        EngineError::InvalidState {
            message: message.into(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for external service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database connection failed: failed to connect"
        );

        let err = StorageError::Query {
            message: "syntax error".to_string(),
        };
        assert_eq!(err.to_string(), "Query failed: syntax error");

        let err = StorageError::Migration {
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: version mismatch");
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::Unavailable {
            message: "server down".to_string(),
            retries: 3,
        };
        assert_eq!(
            err.to_string(),
            "Service unavailable: server down (retries: 3)"
        );

        let err = ServiceError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 401 - unauthorized");

        let err = ServiceError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::not_found("Loop", "loop-123");
        assert_eq!(err.to_string(), "Loop not found: loop-123");

        let err = EngineError::AccessDenied {
            loop_id: "loop-123".to_string(),
        };
        assert_eq!(err.to_string(), "Loop loop-123 is owned by a different user");

        let err = EngineError::invalid_state("no concepts to remediate");
        assert_eq!(err.to_string(), "Invalid state: no concepts to remediate");
    }

    #[test]
    fn test_storage_error_conversion_to_engine_error() {
        let storage_err = StorageError::Query {
            message: "boom".to_string(),
        };
        let engine_err: EngineError = storage_err.into();
        assert!(matches!(engine_err, EngineError::Storage(_)));
    }

    #[test]
    fn test_engine_error_conversion_to_app_error() {
        let engine_err = EngineError::not_found("Concept", "c-1");
        let app_err: AppError = engine_err.into();
        assert!(matches!(app_err, AppError::Engine(_)));
        assert!(app_err.to_string().contains("Concept not found"));
    }
}
