//! Centralized constants for the connector.
//!
//! Default values and fixed names used throughout the codebase.

use std::time::Duration;

// =============================================================================
// Connection Constants
// =============================================================================

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Default connection timeout as Duration.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration =
    Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS);

/// Application name sent to SQL Server.
pub const APPLICATION_NAME: &str = "cloudsql-mssql";

/// User agent sent to the Cloud SQL Admin API.
pub const USER_AGENT: &str = concat!("cloudsql-mssql-rust/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Cloud SQL Admin API Constants
// =============================================================================

/// Default Cloud SQL Admin API endpoint.
pub const DEFAULT_SQLADMIN_ENDPOINT: &str = "https://sqladmin.googleapis.com";

/// GCE metadata server token endpoint.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Connect settings are re-fetched once they are older than this.
pub const DEFAULT_REFRESH_AFTER_SECS: u64 = 3000;

/// Default refresh interval as Duration.
pub const DEFAULT_REFRESH_AFTER: Duration = Duration::from_secs(DEFAULT_REFRESH_AFTER_SECS);

/// Access tokens are treated as expired this long before their real expiry.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// =============================================================================
// Table Layout Constants
// =============================================================================

/// Default content column of a document table.
pub const DEFAULT_CONTENT_COLUMN: &str = "page_content";

/// Default JSON metadata column of a document table.
pub const DEFAULT_METADATA_JSON_COLUMN: &str = "langchain_metadata";

/// Required columns of a chat history table.
pub const CHAT_HISTORY_COLUMNS: [&str; 4] = ["id", "session_id", "data", "type"];

// =============================================================================
// Logging Constants
// =============================================================================

/// Default truncation length for query logging.
pub const LOG_QUERY_TRUNCATE_LENGTH: usize = 100;
