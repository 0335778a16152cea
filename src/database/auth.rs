//! Login and session setup for SQL Server connections.
//!
//! Builds `tiberius` configurations for a plain host and for a resolved Cloud
//! SQL instance, then performs the TCP connect and TDS handshake under one
//! timeout.

use crate::config::{AuthConfig, DatabaseConfig, InstanceConfig};
use crate::constants::APPLICATION_NAME;
use crate::database::connector::ConnectInfo;
use crate::error::MssqlError;
use std::path::Path;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

/// Type alias for a raw tiberius connection.
pub type RawConnection = Client<Compat<TcpStream>>;

/// Configure tiberius authentication method based on AuthConfig.
pub fn configure_auth(config: &mut Config, auth: &AuthConfig) {
    match auth {
        AuthConfig::SqlServer { username, password } => {
            config.authentication(AuthMethod::sql_server(username, password));
        }
    }
}

/// Create a tiberius Config from DatabaseConfig.
pub fn create_base_config(db_config: &DatabaseConfig) -> Config {
    let mut config = Config::new();

    config.host(&db_config.host);
    config.port(db_config.port);

    if let Some(ref database) = db_config.database {
        config.database(database);
    }

    if db_config.encrypt {
        config.encryption(EncryptionLevel::Required);
    } else {
        config.encryption(EncryptionLevel::Off);
    }

    // Trust server certificate if requested
    if db_config.trust_server_certificate {
        config.trust_cert();
    }

    config.application_name(&db_config.application_name);
    configure_auth(&mut config, &db_config.auth);

    config
}

/// Create a tiberius Config for a resolved Cloud SQL instance.
///
/// Encryption is always required, and `ca_path` (a PEM copy of the
/// instance's server CA) is the only trusted root.
pub fn create_instance_config(
    instance: &InstanceConfig,
    info: &ConnectInfo,
    ca_path: &Path,
) -> Config {
    let mut config = Config::new();

    config.host(&info.host);
    config.port(info.port);
    config.database(&instance.database);
    config.encryption(EncryptionLevel::Required);

    config.trust_cert_ca(ca_path.to_string_lossy());

    config.application_name(APPLICATION_NAME);
    configure_auth(&mut config, &instance.auth);

    config
}

/// Open a raw connection: TCP connect, TCP_NODELAY, TDS login.
///
/// The whole sequence is bounded by `connect_timeout`.
pub async fn create_connection(
    config: Config,
    connect_timeout: Duration,
) -> Result<RawConnection, MssqlError> {
    let address = config.get_addr();
    debug!("Creating connection to {}", address);

    let connect = async {
        let tcp = TcpStream::connect(&address).await.map_err(|e| {
            MssqlError::connection_with_source(format!("Failed to connect to {}", address), e)
        })?;

        tcp.set_nodelay(true)
            .map_err(|e| MssqlError::connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| match MssqlError::from(e) {
                err @ (MssqlError::Authentication(_)
                | MssqlError::Connection { .. }
                | MssqlError::Timeout(_)) => err,
                other => MssqlError::connection(format!("Failed to connect to SQL Server: {}", other)),
            })
    };

    let client = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| {
            MssqlError::timeout(format!(
                "Connecting to {} took longer than {:?}",
                address, connect_timeout
            ))
        })??;

    debug!("Connection established successfully");
    Ok(client)
}

/// Truncate a string for logging purposes.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
