//! Error types for the schema broker.
//!
//! Every failure is classified into exactly one [`BrokerError`] kind. The HTTP
//! layer maps kinds to status codes through the `IntoResponse` impl at the
//! bottom of this module; nothing else inspects error text.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::models::ConnectionSignature;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("Connection pool exhausted for {signature}: {message}")]
    PoolExhausted { signature: String, message: String },

    #[error("Connection to {signature} failed: {message}")]
    Connection {
        signature: String,
        message: String,
        suggestion: String,
    },

    #[error("Introspection '{operation}' on {signature} failed: {message}")]
    Introspection {
        signature: String,
        operation: String,
        message: String,
    },

    #[error("Metadata store error: {message}")]
    Storage { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BrokerError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Unknown credential id.
    pub fn credentials_not_found() -> Self {
        Self::NotFound {
            message: "Database credentials not found".to_string(),
        }
    }

    /// No table with the requested name in any user schema.
    pub fn table_not_found() -> Self {
        Self::NotFound {
            message: "Table not found".to_string(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(signature: impl ToString, message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            signature: signature.to_string(),
            message: message.into(),
        }
    }

    /// Create a downstream connection error with a helpful suggestion.
    pub fn connection(
        signature: impl ToString,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            signature: signature.to_string(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an introspection error.
    pub fn introspection(
        signature: impl ToString,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Introspection {
            signature: signature.to_string(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a metadata store error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::Connection { .. } => "connection_error",
            Self::Introspection { .. } => "introspection_error",
            Self::Storage { .. } => "storage_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status for this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Connection { .. } => StatusCode::BAD_GATEWAY,
            Self::Introspection { .. } | Self::Storage { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("Retry later or raise --pool-size/--max-overflow"),
            _ => None,
        }
    }

    /// Retryable errors carry a `Retry-After` header.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::PoolExhausted { .. })
    }
}

/// Errors raised by the primary metadata store.
///
/// Downstream errors must go through [`classify_downstream`] instead; this
/// conversion only exists so store code can use `?` on sqlx calls.
impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = match db_err.code() {
                    Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
                    None => db_err.message().to_string(),
                };
                BrokerError::storage(message)
            }
            sqlx::Error::PoolTimedOut => {
                BrokerError::storage("Timed out waiting for a metadata store connection")
            }
            sqlx::Error::PoolClosed => BrokerError::storage("Metadata store pool is closed"),
            sqlx::Error::Io(io_err) => BrokerError::storage(format!("I/O error: {}", io_err)),
            other => BrokerError::storage(other.to_string()),
        }
    }
}

/// Classify a driver error raised while borrowing a downstream connection.
pub fn classify_downstream(
    err: sqlx::Error,
    signature: &ConnectionSignature,
    operation: &str,
) -> BrokerError {
    match err {
        sqlx::Error::PoolTimedOut => {
            BrokerError::pool_exhausted(signature, "timed out waiting for a connection")
        }
        sqlx::Error::PoolClosed => BrokerError::connection(
            signature,
            "Connection pool is closed",
            "The pool was evicted; retry the request",
        ),
        sqlx::Error::Io(io_err) => BrokerError::connection(
            signature,
            format!("I/O error: {}", io_err),
            "Check that the database server is running and reachable",
        ),
        sqlx::Error::Tls(tls_err) => BrokerError::connection(
            signature,
            format!("TLS error: {}", tls_err),
            "Verify TLS configuration and certificates",
        ),
        sqlx::Error::Protocol(msg) => BrokerError::connection(
            signature,
            format!("Protocol error: {}", msg),
            "Check database server compatibility",
        ),
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            if let Some(suggestion) = connection_failure_suggestion(&code) {
                BrokerError::connection(
                    signature,
                    format!("{} (SQLSTATE: {})", db_err.message(), code),
                    suggestion,
                )
            } else if code.is_empty() {
                BrokerError::introspection(signature, operation, db_err.message())
            } else {
                BrokerError::introspection(
                    signature,
                    operation,
                    format!("{} (SQLSTATE: {})", db_err.message(), code),
                )
            }
        }
        other => BrokerError::introspection(signature, operation, other.to_string()),
    }
}

/// SQLSTATEs that mean the target could not be reached or refused us.
pub(crate) fn connection_failure_suggestion(code: &str) -> Option<&'static str> {
    match code {
        c if c.starts_with("28") => Some("Verify the username and password registered for this database"),
        c if c.starts_with("08") => Some("Check network connectivity and database server status"),
        "3D000" => Some("Check that the database name exists on the server"),
        "53300" | "57P03" => Some("The server is refusing new connections; retry later"),
        _ => None,
    }
}

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Seconds advertised to clients on 502/503 responses.
const RETRY_AFTER_SECS: u64 = 5;

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "detail": self.to_string(),
            "code": self.kind(),
        });
        if let Some(suggestion) = self.suggestion() {
            body["suggestion"] = serde_json::Value::String(suggestion.to_string());
        }
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        }
        let retryable = self.is_retryable();
        let mut response = (status, Json(body)).into_response();
        if retryable {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }
}
