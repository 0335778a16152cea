//! Cloud SQL instance resolution.
//!
//! An [`InstanceConnector`] turns `project:region:instance` into a network
//! address plus the server CA the instance presents. [`CloudSqlConnector`]
//! asks the Cloud SQL Admin API and memoizes both the OAuth2 access token and
//! the connect settings; stale entries are refreshed on the next call, never
//! by a timer.

use crate::config::{ConnectorConfig, InstanceName, IpType, TokenSource};
use crate::constants::{
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_PORT, METADATA_TOKEN_URL, TOKEN_EXPIRY_MARGIN, USER_AGENT,
};
use crate::error::MssqlError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where and how to reach a resolved instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// IP address or hostname
    pub host: String,

    /// TDS port
    pub port: u16,

    /// PEM-encoded server CA certificate; the only root trusted for TLS
    pub server_ca_pem: String,
}

/// Resolves a managed instance identity to a reachable endpoint.
#[async_trait]
pub trait InstanceConnector: Send + Sync {
    /// Resolve `instance` to the address of the requested type.
    async fn resolve(&self, instance: &InstanceName, ip_type: IpType)
        -> Result<ConnectInfo, MssqlError>;

    /// Drop anything cached for `instance` so the next resolve fetches fresh data.
    async fn invalidate(&self, _instance: &InstanceName) {}
}

/// Admin API `connectSettings` response (fields used here only).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSettings {
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
    server_ca_cert: Option<SslCert>,
    region: Option<String>,
    database_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type")]
    ip_type: String,
    ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SslCert {
    cert: String,
}

/// Metadata server token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + TOKEN_EXPIRY_MARGIN >= expires_at,
            None => false,
        }
    }
}

struct CachedSettings {
    settings: ConnectSettings,
    fetched_at: Instant,
}

/// Instance connector backed by the Cloud SQL Admin API.
pub struct CloudSqlConnector {
    http: reqwest::Client,
    config: ConnectorConfig,
    token: Mutex<Option<AccessToken>>,
    settings: Mutex<HashMap<InstanceName, CachedSettings>>,
}

impl CloudSqlConnector {
    /// Create a connector with the given configuration.
    pub fn new(config: ConnectorConfig) -> Result<Self, MssqlError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DEFAULT_CONNECTION_TIMEOUT)
            .build()
            .map_err(|e| MssqlError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
            settings: Mutex::new(HashMap::new()),
        })
    }

    /// Create a connector configured from environment variables.
    pub fn from_env() -> Result<Self, MssqlError> {
        Self::new(ConnectorConfig::from_env())
    }

    /// The connector configuration.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Current access token, fetched again when missing or about to expire.
    async fn access_token(&self) -> Result<String, MssqlError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.value.clone());
        }

        let token = match &self.config.token_source {
            TokenSource::Static(value) => AccessToken {
                value: value.clone(),
                expires_at: None,
            },
            TokenSource::MetadataServer => self.fetch_metadata_token().await?,
        };
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn fetch_metadata_token(&self) -> Result<AccessToken, MssqlError> {
        debug!("Fetching access token from metadata server");

        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
                MssqlError::auth(format!(
                    "Failed to obtain access token from metadata server: {}",
                    e
                ))
            })?;

        if !response.status().is_success() {
            return Err(MssqlError::auth(format!(
                "Metadata server returned HTTP {} for access token request",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| MssqlError::auth(format!("Malformed metadata token response: {}", e)))?;

        Ok(AccessToken {
            value: body.access_token,
            expires_at: Some(Instant::now() + Duration::from_secs(body.expires_in)),
        })
    }

    async fn fetch_connect_settings(
        &self,
        instance: &InstanceName,
    ) -> Result<ConnectSettings, MssqlError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/sql/v1beta4/projects/{}/instances/{}/connectSettings",
            self.config.api_endpoint.trim_end_matches('/'),
            instance.project,
            instance.instance
        );

        debug!("Fetching connect settings for {}", instance);

        let response = self.http.get(&url).bearer_auth(token).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => MssqlError::auth(format!(
                    "Cloud SQL Admin API denied access to {} (HTTP {}): {}",
                    instance, status, body
                )),
                404 => MssqlError::connection(format!(
                    "Cloud SQL instance {} does not exist",
                    instance
                )),
                _ => MssqlError::connection(format!(
                    "Cloud SQL Admin API returned HTTP {} for {}: {}",
                    status, instance, body
                )),
            });
        }

        let settings: ConnectSettings = response.json().await.map_err(|e| {
            MssqlError::connection(format!(
                "Malformed connect settings for {}: {}",
                instance, e
            ))
        })?;

        validate_settings(instance, &settings)?;
        Ok(settings)
    }
}

/// Reject settings that belong to another region or another database engine.
fn validate_settings(instance: &InstanceName, settings: &ConnectSettings) -> Result<(), MssqlError> {
    if let Some(region) = settings.region.as_deref() {
        if region != instance.region {
            return Err(MssqlError::connection(format!(
                "Instance {} is in region '{}', not '{}'",
                instance, region, instance.region
            )));
        }
    }

    if let Some(version) = settings.database_version.as_deref() {
        if !version.starts_with("SQLSERVER") {
            return Err(MssqlError::connection(format!(
                "Instance {} runs {}, not SQL Server",
                instance, version
            )));
        }
    }

    Ok(())
}

/// Pick the address of the requested type out of the settings.
fn select_address(
    instance: &InstanceName,
    settings: &ConnectSettings,
    ip_type: IpType,
) -> Result<ConnectInfo, MssqlError> {
    let address = settings
        .ip_addresses
        .iter()
        .find(|ip| ip.ip_type == ip_type.api_name())
        .ok_or_else(|| {
            MssqlError::connection(format!(
                "Instance {} has no {} IP address",
                instance,
                ip_type.api_name()
            ))
        })?;

    let server_ca_pem = settings
        .server_ca_cert
        .as_ref()
        .map(|c| c.cert.trim())
        .filter(|pem| !pem.is_empty())
        .ok_or_else(|| {
            MssqlError::connection(format!(
                "Instance {} published no server CA certificate; refusing an unverified TLS connection",
                instance
            ))
        })?;

    Ok(ConnectInfo {
        host: address.ip_address.clone(),
        port: DEFAULT_PORT,
        server_ca_pem: server_ca_pem.to_string(),
    })
}

#[async_trait]
impl InstanceConnector for CloudSqlConnector {
    async fn resolve(
        &self,
        instance: &InstanceName,
        ip_type: IpType,
    ) -> Result<ConnectInfo, MssqlError> {
        // Held across the fetch so concurrent callers share one refresh.
        let mut cache = self.settings.lock().await;

        if let Some(entry) = cache.get(instance) {
            if entry.fetched_at.elapsed() < self.config.refresh_after {
                return select_address(instance, &entry.settings, ip_type);
            }
            debug!("Connect settings for {} are stale, refreshing", instance);
        }

        let settings = self.fetch_connect_settings(instance).await?;
        info!("Resolved Cloud SQL instance {}", instance);

        let info = select_address(instance, &settings, ip_type)?;
        cache.insert(
            instance.clone(),
            CachedSettings {
                settings,
                fetched_at: Instant::now(),
            },
        );
        Ok(info)
    }

    async fn invalidate(&self, instance: &InstanceName) {
        if self.settings.lock().await.remove(instance).is_some() {
            warn!("Dropped cached connect settings for {}", instance);
        }
    }
}

/// Write an instance's server CA to a per-instance PEM file in the temp dir.
///
/// The driver loads trust roots from a path, so the PEM must exist on disk
/// for the duration of the TLS handshake.
pub async fn write_server_ca(instance: &InstanceName, pem: &str) -> Result<PathBuf, MssqlError> {
    let file_name: String = format!("cloudsql-mssql-{}-ca.pem", instance)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let path = std::env::temp_dir().join(file_name);

    tokio::fs::write(&path, pem).await.map_err(|e| {
        MssqlError::connection_with_source(
            format!("Failed to write server CA for {} to {}", instance, path.display()),
            e,
        )
    })?;
    Ok(path)
}
