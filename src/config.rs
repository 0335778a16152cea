//! Configuration for engines and instance connectors.
//!
//! Configuration can be built in code or loaded from environment variables
//! following the 12-factor app pattern.

use crate::constants::{
    APPLICATION_NAME, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_PORT,
    DEFAULT_REFRESH_AFTER, DEFAULT_REFRESH_AFTER_SECS, DEFAULT_SQLADMIN_ENDPOINT,
};
use crate::error::MssqlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Direct connection configuration for a reachable SQL Server host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQL Server hostname or IP address
    pub host: String,

    /// SQL Server port (default: 1433)
    pub port: u16,

    /// Database name
    pub database: Option<String>,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Enable TLS encryption
    pub encrypt: bool,

    /// Trust server certificate (for self-signed certs)
    pub trust_server_certificate: bool,

    /// Application name sent to SQL Server
    pub application_name: String,

    /// Time allowed for TCP connect plus TDS login
    pub connect_timeout: Duration,
}

/// Authentication configuration.
#[derive(Clone, Serialize, Deserialize)]
pub enum AuthConfig {
    /// SQL Server authentication (username/password)
    SqlServer { username: String, password: String },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

impl AuthConfig {
    /// SQL Server login.
    pub fn sql_server(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthConfig::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Identity of a Cloud SQL instance: `project:region:instance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceName {
    pub project: String,
    pub region: String,
    pub instance: String,
}

impl InstanceName {
    /// Build an instance name, rejecting empty parts.
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        instance: impl Into<String>,
    ) -> Result<Self, MssqlError> {
        let name = Self {
            project: project.into(),
            region: region.into(),
            instance: instance.into(),
        };
        if name.project.is_empty() || name.region.is_empty() || name.instance.is_empty() {
            return Err(MssqlError::config(format!(
                "Invalid instance connection name '{}': project, region and instance are required",
                name
            )));
        }
        Ok(name)
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.instance)
    }
}

impl FromStr for InstanceName {
    type Err = MssqlError;

    /// Parse `project:region:instance`. The project may itself contain a
    /// colon for domain-scoped projects (`example.com:project`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let instance = parts.next().unwrap_or_default();
        let region = parts.next();
        let project = parts.next();
        match (project, region) {
            (Some(project), Some(region)) => InstanceName::new(project, region, instance),
            _ => Err(MssqlError::config(format!(
                "Invalid instance connection name '{}': expected 'project:region:instance'",
                s
            ))),
        }
    }
}

/// Which address of the instance to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpType {
    #[default]
    Public,
    Private,
}

impl IpType {
    /// The `type` value used by the Cloud SQL Admin API.
    pub fn api_name(&self) -> &'static str {
        match self {
            IpType::Public => "PRIMARY",
            IpType::Private => "PRIVATE",
        }
    }
}

impl FromStr for IpType {
    type Err = MssqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" | "primary" => Ok(IpType::Public),
            "private" => Ok(IpType::Private),
            other => Err(MssqlError::config(format!(
                "Unsupported IP type '{}': expected 'public' or 'private'",
                other
            ))),
        }
    }
}

/// Configuration for an engine backed by a Cloud SQL instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance identity
    pub instance: InstanceName,

    /// Database to open on the instance
    pub database: String,

    /// Database login
    pub auth: AuthConfig,

    /// Which instance address to use
    pub ip_type: IpType,

    /// Time allowed for TCP connect plus TDS login
    pub connect_timeout: Duration,
}

impl InstanceConfig {
    /// Build an instance configuration with default IP type and timeout.
    pub fn new(
        instance: InstanceName,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            instance,
            database: database.into(),
            auth: AuthConfig::sql_server(user, password),
            ip_type: IpType::default(),
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    /// Use a different instance address.
    pub fn with_ip_type(mut self, ip_type: IpType) -> Self {
        self.ip_type = ip_type;
        self
    }

    /// Load instance configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Required
    /// - `CLOUDSQL_INSTANCE_CONNECTION_NAME` (`project:region:instance`), or all of
    ///   `CLOUDSQL_PROJECT_ID`, `CLOUDSQL_REGION` and `CLOUDSQL_INSTANCE`
    /// - `MSSQL_DATABASE`: Database name
    /// - `MSSQL_USER`: Database user
    /// - `MSSQL_PASSWORD`: Database password
    ///
    /// ## Optional
    /// - `CLOUDSQL_IP_TYPE`: `public` (default) or `private`
    /// - `MSSQL_CONNECT_TIMEOUT`: Connection timeout in seconds (default: 30)
    pub fn from_env() -> Result<Self, MssqlError> {
        let instance = match std::env::var("CLOUDSQL_INSTANCE_CONNECTION_NAME") {
            Ok(name) => name.parse()?,
            Err(_) => InstanceName::new(
                required_env("CLOUDSQL_PROJECT_ID")?,
                required_env("CLOUDSQL_REGION")?,
                required_env("CLOUDSQL_INSTANCE")?,
            )?,
        };

        let database = required_env("MSSQL_DATABASE")?;
        let auth = sql_auth_from_env()?;

        let ip_type = match std::env::var("CLOUDSQL_IP_TYPE") {
            Ok(v) => v.parse()?,
            Err(_) => IpType::default(),
        };

        Ok(Self {
            instance,
            database,
            auth,
            ip_type,
            connect_timeout: connect_timeout_from_env(),
        })
    }
}

impl DatabaseConfig {
    /// Build a direct configuration with TLS off and default timeouts.
    pub fn new(host: impl Into<String>, port: u16, auth: AuthConfig) -> Self {
        Self {
            host: host.into(),
            port,
            database: None,
            auth,
            encrypt: false,
            trust_server_certificate: false,
            application_name: APPLICATION_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    /// Set the database to open.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Load direct configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Required
    /// - `MSSQL_HOST`: SQL Server hostname
    /// - `MSSQL_USER`: SQL Server username
    /// - `MSSQL_PASSWORD`: SQL Server password
    ///
    /// ## Optional
    /// - `MSSQL_PORT`: Port number (default: 1433)
    /// - `MSSQL_DATABASE`: Database name
    /// - `MSSQL_ENCRYPT`: Enable TLS (default: true)
    /// - `MSSQL_TRUST_CERT`: Trust server certificate (default: false)
    /// - `MSSQL_CONNECT_TIMEOUT`: Connection timeout in seconds (default: 30)
    pub fn from_env() -> Result<Self, MssqlError> {
        let host = std::env::var("MSSQL_HOST")
            .map_err(|_| MssqlError::config("MSSQL_HOST environment variable is required"))?;

        let auth = sql_auth_from_env()?;

        let port = std::env::var("MSSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let database = std::env::var("MSSQL_DATABASE").ok();

        let encrypt = std::env::var("MSSQL_ENCRYPT")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(true);

        let trust_server_certificate = std::env::var("MSSQL_TRUST_CERT")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        Ok(DatabaseConfig {
            host,
            port,
            database,
            auth,
            encrypt,
            trust_server_certificate,
            application_name: APPLICATION_NAME.to_string(),
            connect_timeout: connect_timeout_from_env(),
        })
    }
}

/// Where the Cloud SQL connector gets OAuth2 access tokens.
#[derive(Clone, Serialize, Deserialize, Default)]
pub enum TokenSource {
    /// A fixed access token (e.g. from `gcloud auth print-access-token`).
    Static(String),
    /// The GCE/GKE/Cloud Run metadata server.
    #[default]
    MetadataServer,
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Static(_) => f.write_str("Static(***)"),
            TokenSource::MetadataServer => f.write_str("MetadataServer"),
        }
    }
}

/// Cloud SQL connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Cloud SQL Admin API base URL
    pub api_endpoint: String,

    /// Token source for Admin API calls
    pub token_source: TokenSource,

    /// Maximum age of cached connect settings before they are re-fetched on use
    pub refresh_after: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_SQLADMIN_ENDPOINT.to_string(),
            token_source: TokenSource::default(),
            refresh_after: DEFAULT_REFRESH_AFTER,
        }
    }
}

impl ConnectorConfig {
    /// Load connector configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Optional
    /// - `CLOUDSQL_API_ENDPOINT`: Admin API base URL
    /// - `GOOGLE_OAUTH_ACCESS_TOKEN`: Static access token (default: metadata server)
    /// - `CLOUDSQL_REFRESH_AFTER`: Connect settings refresh age in seconds (default: 3000)
    pub fn from_env() -> Self {
        let api_endpoint = std::env::var("CLOUDSQL_API_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_SQLADMIN_ENDPOINT.to_string());

        let token_source = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(TokenSource::Static)
            .unwrap_or_default();

        let refresh_after_secs = std::env::var("CLOUDSQL_REFRESH_AFTER")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_REFRESH_AFTER_SECS);

        Self {
            api_endpoint,
            token_source,
            refresh_after: Duration::from_secs(refresh_after_secs),
        }
    }
}

fn required_env(name: &str) -> Result<String, MssqlError> {
    std::env::var(name)
        .map_err(|_| MssqlError::config(format!("{} environment variable is required", name)))
}

fn sql_auth_from_env() -> Result<AuthConfig, MssqlError> {
    let username = std::env::var("MSSQL_USER").ok();
    let password = std::env::var("MSSQL_PASSWORD").ok();

    match (username, password) {
        (Some(u), Some(p)) => Ok(AuthConfig::SqlServer {
            username: u,
            password: p,
        }),
        (Some(_), None) => Err(MssqlError::config(
            "MSSQL_PASSWORD is required when MSSQL_USER is set",
        )),
        (None, Some(_)) => Err(MssqlError::config(
            "MSSQL_USER is required when MSSQL_PASSWORD is set",
        )),
        (None, None) => Err(MssqlError::config(
            "Authentication required: set MSSQL_USER and MSSQL_PASSWORD",
        )),
    }
}

fn connect_timeout_from_env() -> Duration {
    let secs = std::env::var("MSSQL_CONNECT_TIMEOUT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS);
    Duration::from_secs(secs)
}
