//! Error types for the Cloud SQL for SQL Server connector.
//!
//! This module defines semantic error types with SQL Server error code mapping
//! so that callers can tell connection, query, decode and privilege failures apart.

use std::fmt;
use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MssqlError>;

/// Coarse classification of an [`MssqlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Instance resolution, credential or transport failure.
    Connection,
    /// Malformed query, missing table or column, server-side statement failure.
    Query,
    /// Stored payload that cannot be turned back into a typed value.
    Decode,
    /// DDL/DML permission denial.
    Privilege,
    /// Invalid configuration.
    Config,
    /// Invalid argument supplied by the caller.
    InvalidInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Query => "query",
            ErrorKind::Decode => "decode",
            ErrorKind::Privilege => "privilege",
            ErrorKind::Config => "config",
            ErrorKind::InvalidInput => "invalid_input",
        };
        f.write_str(name)
    }
}

/// Domain-specific errors for the connector.
#[derive(Debug, Error)]
pub enum MssqlError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Object not found (table, column, etc.)
    #[error("{object_type} not found: {name}")]
    ObjectNotFound { object_type: String, name: String },

    /// Table exists but does not have the expected shape
    #[error("Schema mismatch: {0}")]
    Schema(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Query execution error
    #[error("Query execution error: {message}")]
    QueryExecution {
        message: String,
        sql_error_code: Option<i32>,
    },

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored value could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Connect or command timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Table or column name that cannot be spliced into SQL text
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MssqlError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an object not found error.
    pub fn object_not_found(object_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            object_type: object_type.into(),
            name: name.into(),
        }
    }

    /// Create a schema mismatch error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a permission denied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a query execution error.
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::QueryExecution {
            message: msg.into(),
            sql_error_code: None,
        }
    }

    /// Create a query execution error with the SQL Server error number.
    pub fn query_error_with_code(msg: impl Into<String>, code: i32) -> Self {
        Self::QueryExecution {
            message: msg.into(),
            sql_error_code: Some(code),
        }
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid identifier error.
    pub fn invalid_identifier(msg: impl Into<String>) -> Self {
        Self::InvalidIdentifier(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Authentication(_) | Self::Timeout(_) => {
                ErrorKind::Connection
            }
            Self::ObjectNotFound { .. }
            | Self::Schema(_)
            | Self::QueryExecution { .. }
            | Self::ConstraintViolation(_)
            | Self::InvalidIdentifier(_)
            | Self::Internal(_) => ErrorKind::Query,
            Self::Decode(_) => ErrorKind::Decode,
            Self::PermissionDenied(_) => ErrorKind::Privilege,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Prefix the error message with caller context (table, session, ...).
    ///
    /// The variant is preserved so `kind()` and pattern matching keep working.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        let prefix = |msg: String| format!("{}: {}", context, msg);
        match self {
            Self::Config(m) => Self::Config(prefix(m)),
            Self::Connection { message, source } => Self::Connection {
                message: prefix(message),
                source,
            },
            Self::Authentication(m) => Self::Authentication(prefix(m)),
            Self::ObjectNotFound { object_type, name } => Self::ObjectNotFound {
                object_type,
                name: prefix(name),
            },
            Self::Schema(m) => Self::Schema(prefix(m)),
            Self::PermissionDenied(m) => Self::PermissionDenied(prefix(m)),
            Self::QueryExecution {
                message,
                sql_error_code,
            } => Self::QueryExecution {
                message: prefix(message),
                sql_error_code,
            },
            Self::ConstraintViolation(m) => Self::ConstraintViolation(prefix(m)),
            Self::Decode(m) => Self::Decode(prefix(m)),
            Self::Timeout(m) => Self::Timeout(prefix(m)),
            Self::InvalidIdentifier(m) => Self::InvalidIdentifier(prefix(m)),
            Self::InvalidInput(m) => Self::InvalidInput(prefix(m)),
            Self::Internal(m) => Self::Internal(prefix(m)),
        }
    }

    /// Check if this error is transient and may succeed on retry.
    ///
    /// The crate itself never retries.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout(_) => true,
            Self::QueryExecution {
                sql_error_code: Some(code),
                ..
            } => is_transient_sql_error(*code),
            _ => false,
        }
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check your environment variables and configuration"),
            Self::Connection { .. } => Some(
                "Check the instance connection name, network path and Cloud SQL Admin API access",
            ),
            Self::Authentication(_) => Some("Verify the database user and password"),
            Self::ObjectNotFound { .. } => Some("Check the table name and schema"),
            Self::InvalidIdentifier(_) => {
                Some("Use a plain table or column name without quotes, comments or semicolons")
            }
            Self::Schema(_) => Some(
                "Create the table with MssqlEngine::init_chat_history_table or fix its columns",
            ),
            Self::PermissionDenied(_) => {
                Some("Request appropriate permissions from your database administrator")
            }
            Self::Decode(_) => Some("The stored row was not written by a compatible client"),
            Self::Timeout(_) => Some("Check network latency or increase the connect timeout"),
            Self::ConstraintViolation(_) => {
                Some("Check the constraint definition and your data values")
            }
            _ => None,
        }
    }
}

/// Map SQL Server error codes to semantic error types.
pub fn from_sql_error(code: i32, message: &str) -> MssqlError {
    match code {
        // Authentication errors
        18456 => MssqlError::auth(format!("Login failed: {}", message)),

        // Database errors
        4060 => MssqlError::connection(format!("Cannot open database: {}", message)),

        // Object not found errors
        208 => MssqlError::object_not_found("Object", message),

        // Permission errors
        229 | 230 => MssqlError::permission_denied(message),
        262 => MssqlError::permission_denied(format!("CREATE permission denied: {}", message)),
        3701 => MssqlError::permission_denied(format!("DROP permission denied: {}", message)),

        // Connection errors
        -1 => MssqlError::connection("Connection broken"),
        53 => MssqlError::connection("Server not found or not accessible"),

        // Constraint violations
        547 => MssqlError::ConstraintViolation(message.to_string()),
        2601 | 2627 => MssqlError::ConstraintViolation(format!("Duplicate key: {}", message)),

        // Syntax errors
        102 => MssqlError::query_error_with_code(format!("Syntax error: {}", message), code),

        // Invalid column/object
        207 => MssqlError::query_error_with_code(format!("Invalid column: {}", message), code),
        2714 => MssqlError::query_error_with_code(format!("Object exists: {}", message), code),

        // Deadlock
        1205 => MssqlError::query_error_with_code(
            "Transaction was deadlocked and has been rolled back",
            code,
        ),

        // Default: generic query error
        _ => MssqlError::query_error_with_code(message, code),
    }
}

/// Check if a SQL Server error code indicates a transient error.
fn is_transient_sql_error(code: i32) -> bool {
    matches!(
        code,
        -2      // Timeout
        | -1    // Connection broken
        | 1205  // Deadlock
        | 10053 // Connection forcibly closed
        | 10054 // Connection reset
        | 10060 // Connection timed out
    )
}

impl From<tiberius::error::Error> for MssqlError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match &e {
            Error::Server(token) => from_sql_error(token.code() as i32, token.message()),
            Error::Io { kind, message } => match kind {
                std::io::ErrorKind::TimedOut => MssqlError::timeout(message.clone()),
                _ => MssqlError::connection(format!("IO error: {}", message)),
            },
            Error::Tls(msg) => MssqlError::connection(format!("TLS error: {}", msg)),
            Error::Protocol(msg) => MssqlError::connection(format!("Protocol error: {}", msg)),
            Error::Routing { host, port } => MssqlError::connection(format!(
                "Server requested routing to {}:{}, which is not followed",
                host, port
            )),
            Error::Conversion(msg) => {
                MssqlError::query_error(format!("Type conversion error: {}", msg))
            }
            Error::Encoding(msg) => MssqlError::query_error(format!("Encoding error: {}", msg)),
            Error::Utf8 | Error::Utf16 => {
                MssqlError::decode(format!("Invalid string data: {}", e))
            }
            _ => MssqlError::internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for MssqlError {
    fn from(e: serde_json::Error) -> Self {
        MssqlError::decode(format!("Invalid JSON payload: {}", e))
    }
}

impl From<reqwest::Error> for MssqlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return MssqlError::timeout(format!("Cloud SQL Admin API request timed out: {}", e));
        }
        MssqlError::connection_with_source("Cloud SQL Admin API request failed", e)
    }
}
