//! Connection manager for a SQL Server database.
//!
//! An [`MssqlEngine`] owns one `tiberius` client behind a mutex. The client is
//! opened lazily on the first [`MssqlEngine::connect`]; the returned guard is
//! the context every loader, saver and history operation runs in, and holding
//! it serializes access to the connection.

use crate::config::{DatabaseConfig, InstanceConfig, InstanceName};
use crate::database::auth::{create_base_config, create_connection, create_instance_config};
use crate::database::connector::{write_server_ca, CloudSqlConnector, InstanceConnector};
use crate::database::query::{self, QueryResult};
use crate::database::schema::{
    chat_history_table_ddl, document_table_ddl, drop_table_ddl, ColumnDef,
};
use crate::database::RawConnection;
use crate::error::{ErrorKind, MssqlError};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tiberius::ToSql;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// What the engine has learned about its cached client from the operations
/// that used it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ConnectionState {
    /// A connection-kind failure was seen; the client must be replaced.
    broken: bool,
    /// `BEGIN TRANSACTION` was sent and no COMMIT or ROLLBACK has completed.
    open_transaction: bool,
}

impl ConnectionState {
    fn observe(&mut self, err: &MssqlError) {
        if err.kind() == ErrorKind::Connection {
            self.broken = true;
        }
    }

    fn needs_rollback(&self) -> bool {
        self.open_transaction && !self.broken
    }
}

struct Slot {
    client: RawConnection,
    state: ConnectionState,
}

impl Slot {
    fn new(client: RawConnection) -> Self {
        Self {
            client,
            state: ConnectionState::default(),
        }
    }
}

/// Exclusive access to an engine's live connection.
///
/// Dereferences to the `tiberius` client. Failures seen through the methods
/// here (or reported with [`track`](Self::track)) decide whether the next
/// [`MssqlEngine::connect`] reuses the client, rolls back an abandoned
/// transaction first, or opens a new client.
pub struct EngineConnection<'a> {
    slot: MappedMutexGuard<'a, Slot>,
}

impl Deref for EngineConnection<'_> {
    type Target = RawConnection;

    fn deref(&self) -> &RawConnection {
        &self.slot.client
    }
}

impl DerefMut for EngineConnection<'_> {
    fn deref_mut(&mut self) -> &mut RawConnection {
        &mut self.slot.client
    }
}

impl fmt::Debug for EngineConnection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConnection")
            .field("state", &self.slot.state)
            .finish()
    }
}

impl EngineConnection<'_> {
    /// Record the outcome of an operation run directly on the client.
    ///
    /// A connection-kind failure marks the client broken so the next
    /// [`MssqlEngine::connect`] replaces it.
    pub fn track<T>(&mut self, result: Result<T, MssqlError>) -> Result<T, MssqlError> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Connection && !self.slot.state.broken {
                warn!("Connection marked broken: {}", e);
            }
            self.slot.state.observe(e);
        }
        result
    }

    /// Run a row-returning statement and collect its first result set.
    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult, MssqlError> {
        let result = query::fetch_all(&mut self.slot.client, sql, params).await;
        self.track(result)
    }

    /// Run a statement that modifies data and return the rows affected.
    pub async fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, MssqlError> {
        let result = query::execute(&mut self.slot.client, sql, params).await;
        self.track(result)
    }

    /// Run parameterless batch text.
    pub async fn execute_batch(&mut self, sql: &str) -> Result<(), MssqlError> {
        let result = query::execute_batch(&mut self.slot.client, sql).await;
        self.track(result)
    }

    /// Start an explicit transaction.
    ///
    /// Finish it with [`finish_transaction`](Self::finish_transaction). If the
    /// guard is dropped first, the next [`MssqlEngine::connect`] rolls it back.
    pub async fn begin_transaction(&mut self) -> Result<(), MssqlError> {
        self.slot.state.open_transaction = true;
        let result = query::begin_transaction(&mut self.slot.client).await;
        self.track(result)
    }

    /// Commit when `outcome` is `Ok`, roll back otherwise.
    ///
    /// A failed commit is rolled back too and its error returned.
    pub async fn finish_transaction<T>(
        &mut self,
        outcome: Result<T, MssqlError>,
    ) -> Result<T, MssqlError> {
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                self.roll_back().await;
                return Err(e);
            }
        };

        let committed = query::commit_transaction(&mut self.slot.client).await;
        match self.track(committed) {
            Ok(()) => {
                self.slot.state.open_transaction = false;
                Ok(value)
            }
            Err(e) => {
                self.roll_back().await;
                Err(e)
            }
        }
    }

    async fn roll_back(&mut self) {
        // A broken client is discarded, and the server drops its transaction with it.
        if self.slot.state.broken {
            return;
        }
        let rolled_back = query::rollback_transaction(&mut self.slot.client).await;
        match self.track(rolled_back) {
            Ok(()) => self.slot.state.open_transaction = false,
            Err(e) => warn!("Rollback failed: {}", e),
        }
    }
}

/// Where the engine's connection comes from.
enum Target {
    /// Managed instance resolved through a connector.
    Instance {
        config: InstanceConfig,
        connector: Arc<dyn InstanceConnector>,
    },
    /// Plain host and port.
    Direct(DatabaseConfig),
    /// Client built by the caller; cannot be reopened.
    Provided,
}

/// Connection manager for one SQL Server database.
pub struct MssqlEngine {
    target: Target,
    client: Mutex<Option<Slot>>,
}

impl fmt::Debug for MssqlEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Instance { config, .. } => format!("instance {}", config.instance),
            Target::Direct(config) => format!("{}:{}", config.host, config.port),
            Target::Provided => "provided client".to_string(),
        };
        f.debug_struct("MssqlEngine").field("target", &target).finish()
    }
}

impl MssqlEngine {
    /// Engine for a Cloud SQL for SQL Server instance.
    ///
    /// No network call is made here; the instance is resolved and the login
    /// performed on the first [`connect`](Self::connect). The engine gets its
    /// own connector configured from the environment (see
    /// [`ConnectorConfig::from_env`](crate::config::ConnectorConfig::from_env));
    /// use [`from_instance_config`](Self::from_instance_config) to share one.
    pub fn from_instance(
        project_id: &str,
        region: &str,
        instance: &str,
        database: &str,
        user: &str,
        password: &str,
    ) -> Result<Self, MssqlError> {
        let name = InstanceName::new(project_id, region, instance)?;
        let config = InstanceConfig::new(name, database, user, password);
        let connector = CloudSqlConnector::from_env()?;
        Ok(Self::from_instance_config(config, Arc::new(connector)))
    }

    /// Engine for an instance resolved by the given connector.
    pub fn from_instance_config(
        config: InstanceConfig,
        connector: Arc<dyn InstanceConnector>,
    ) -> Self {
        Self::with_target(Target::Instance { config, connector })
    }

    /// Engine for a directly reachable SQL Server.
    pub fn from_config(config: DatabaseConfig) -> Self {
        Self::with_target(Target::Direct(config))
    }

    /// Engine wrapping a client the caller has already connected.
    pub fn from_connection(client: RawConnection) -> Self {
        Self {
            target: Target::Provided,
            client: Mutex::new(Some(Slot::new(client))),
        }
    }

    fn with_target(target: Target) -> Self {
        Self {
            target,
            client: Mutex::new(None),
        }
    }

    /// Borrow the engine's connection, opening it first if needed.
    ///
    /// A client marked broken is replaced, and a transaction left open by an
    /// interrupted operation is rolled back before the guard is handed out.
    pub async fn connect(&self) -> Result<EngineConnection<'_>, MssqlError> {
        let mut guard = self.client.lock().await;

        let discard = match guard.as_mut() {
            Some(slot) => {
                if slot.state.needs_rollback() {
                    warn!("Rolling back a transaction left open by an interrupted operation");
                    match query::rollback_transaction(&mut slot.client).await {
                        Ok(()) => slot.state.open_transaction = false,
                        Err(e) => {
                            warn!("Rollback failed: {}", e);
                            slot.state.broken = true;
                        }
                    }
                }
                slot.state.broken
            }
            None => false,
        };
        if discard {
            warn!("Discarding broken connection");
            *guard = None;
        }

        if guard.is_none() {
            *guard = Some(Slot::new(self.open().await?));
        }
        MutexGuard::try_map(guard, Option::as_mut)
            .map(|slot| EngineConnection { slot })
            .map_err(|_| MssqlError::internal("Connection slot emptied while locked"))
    }

    /// Close the connection. Engines built from configuration reconnect on
    /// the next [`connect`](Self::connect).
    pub async fn close(&self) -> Result<(), MssqlError> {
        let slot = self.client.lock().await.take();
        match slot {
            Some(slot) if slot.state.broken => debug!("Broken connection dropped"),
            Some(slot) => {
                slot.client.close().await?;
                debug!("Connection closed");
            }
            None => {}
        }
        Ok(())
    }

    /// Whether a usable connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.client
            .lock()
            .await
            .as_ref()
            .is_some_and(|slot| !slot.state.broken)
    }

    async fn open(&self) -> Result<RawConnection, MssqlError> {
        match &self.target {
            Target::Instance { config, connector } => {
                let info = connector.resolve(&config.instance, config.ip_type).await?;
                let ca_path = write_server_ca(&config.instance, &info.server_ca_pem).await?;
                let tds_config = create_instance_config(config, &info, &ca_path);

                match create_connection(tds_config, config.connect_timeout).await {
                    Ok(client) => {
                        info!(
                            "Connected to Cloud SQL instance {} at {}",
                            config.instance, info.host
                        );
                        Ok(client)
                    }
                    Err(e) => {
                        // Settings may be outdated (IP or CA rotation).
                        if e.kind() == ErrorKind::Connection {
                            connector.invalidate(&config.instance).await;
                        }
                        Err(e.with_context(format!("instance {}", config.instance)))
                    }
                }
            }
            Target::Direct(config) => {
                let client =
                    create_connection(create_base_config(config), config.connect_timeout).await?;
                info!("Connected to SQL Server at {}:{}", config.host, config.port);
                Ok(client)
            }
            Target::Provided => {
                warn!("Connect attempted on a closed engine that wraps a caller-built client");
                Err(MssqlError::connection(
                    "Connection was closed and engines built from an existing client cannot reconnect",
                ))
            }
        }
    }

    /// Create a chat history table unless it already exists.
    ///
    /// The table has the columns `id` (identity, primary key), `session_id`,
    /// `data` and `type`. Calling this again never drops or alters data.
    pub async fn init_chat_history_table(&self, table_name: &str) -> Result<(), MssqlError> {
        let ddl = chat_history_table_ddl(table_name)?;
        let mut conn = self.connect().await?;
        conn.execute_batch(&ddl)
            .await
            .map_err(|e| e.with_context(format!("table '{}'", table_name)))?;
        info!("Chat history table '{}' is ready", table_name);
        Ok(())
    }

    /// Create a table to hold documents.
    ///
    /// The content column is `NVARCHAR(MAX) NOT NULL`, followed by
    /// `metadata_columns` and, when given, a nullable JSON metadata column.
    /// With `overwrite_existing` an existing table is dropped first; without
    /// it, an existing table makes the CREATE fail.
    pub async fn init_document_table(
        &self,
        table_name: &str,
        metadata_columns: &[ColumnDef],
        content_column: &str,
        metadata_json_column: Option<&str>,
        overwrite_existing: bool,
    ) -> Result<(), MssqlError> {
        let create = document_table_ddl(
            table_name,
            content_column,
            metadata_columns,
            metadata_json_column,
        )?;
        let drop = drop_table_ddl(table_name)?;

        let mut conn = self.connect().await?;
        let context = |e: MssqlError| e.with_context(format!("table '{}'", table_name));

        if overwrite_existing {
            conn.execute_batch(&drop).await.map_err(context)?;
        }
        conn.execute_batch(&create).await.map_err(context)?;

        info!("Document table '{}' created", table_name);
        Ok(())
    }
}
