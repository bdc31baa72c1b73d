//! Error types for tablekeeper.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Each variant carries enough context (database name, attempt count, operation) for
//! operators to act on it, and maps onto a stable HTTP status and reason code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Cloneable so one failed pool creation can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Failed to create pool for database '{database}' after {attempts} attempt(s): {source}")]
    PoolCreation {
        database: String,
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("No pool registered for database '{database}'")]
    PoolNotFound { database: String },

    #[error("Invalid permission type '{value}'. Expected one of READ, WRITE, DELETE, CREATE")]
    InvalidPermissionType { value: String },

    #[error("Permission lookup failed: {message}")]
    PermissionLookup { message: String },

    #[error("Permission change failed: {operation} - {message}")]
    PermissionWrite { operation: String, message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap the last creation failure once retries are exhausted.
    pub fn pool_creation(database: impl Into<String>, attempts: u32, source: DbError) -> Self {
        Self::PoolCreation {
            database: database.into(),
            attempts,
            source: Box::new(source),
        }
    }

    pub fn pool_not_found(database: impl Into<String>) -> Self {
        Self::PoolNotFound {
            database: database.into(),
        }
    }

    pub fn invalid_permission_type(value: impl Into<String>) -> Self {
        Self::InvalidPermissionType {
            value: value.into(),
        }
    }

    pub fn permission_lookup(message: impl Into<String>) -> Self {
        Self::PermissionLookup {
            message: message.into(),
        }
    }

    pub fn permission_write(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermissionWrite {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolCreation { source, .. } => source.suggestion(),
            Self::PoolNotFound { .. } => {
                Some("Request the database once so its pool is created, then retry")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::PoolCreation { .. } => "POOL_CREATION_FAILED",
            Self::PoolNotFound { .. } => "POOL_NOT_FOUND",
            Self::InvalidPermissionType { .. } => "INVALID_PERMISSION_TYPE",
            Self::PermissionLookup { .. } => "PERMISSION_LOOKUP_FAILED",
            Self::PermissionWrite { .. } => "PERMISSION_WRITE_FAILED",
        }
    }

    /// HTTP status for this error category.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput { .. } | Self::InvalidPermissionType { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::PoolNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection { .. } | Self::PoolCreation { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database { .. }
            | Self::Internal { .. }
            | Self::PermissionLookup { .. }
            | Self::PermissionWrite { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// JSON error envelope shared by every HTTP error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorBody {
    pub fn new(code: &'static str, message: impl Into<String>, suggestion: Option<String>) -> Self {
        Self {
            error: ErrorDetail {
                code,
                message: message.into(),
                suggestion,
            },
        }
    }
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorBody::new(
            self.code(),
            self.to_string(),
            self.suggestion().map(String::from),
        );
        (status, axum::Json(body)).into_response()
    }
}
