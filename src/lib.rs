//! # Cloud SQL for SQL Server connector
//!
//! Read SQL Server tables as documents and keep chat transcripts in a SQL
//! Server table, for LLM applications running against Cloud SQL for SQL
//! Server (or any reachable SQL Server).
//!
//! This crate provides:
//! - **Engine**: [`MssqlEngine`] resolves a Cloud SQL instance (or a plain
//!   host) to one lazily opened `tiberius` connection
//! - **Loader**: [`MssqlLoader`] maps result rows to [`Document`]s with
//!   configurable content and metadata columns
//! - **History**: [`MssqlChatMessageHistory`] appends, reads and clears the
//!   messages of one chat session
//! - **Saver**: [`MssqlDocumentSaver`] writes documents back to a table
//!
//! ## Example
//!
//! ```no_run
//! use cloudsql_mssql::{ChatMessage, MssqlChatMessageHistory, MssqlEngine};
//! use std::sync::Arc;
//!
//! # async fn run() -> cloudsql_mssql::Result<()> {
//! let engine = Arc::new(MssqlEngine::from_instance(
//!     "my-project", "us-central1", "my-instance", "appdb", "sqlserver", "secret",
//! )?);
//! engine.init_chat_history_table("message_store").await?;
//!
//! let history = MssqlChatMessageHistory::new(engine, "message_store", "abc").await?;
//! history.add_message(&ChatMessage::human("hi!")).await?;
//! for message in history.messages().await? {
//!     println!("{}: {}", message.message_type(), message.content());
//! }
//! # Ok(())
//! # }
//! ```

pub mod chat_history;
pub mod config;
pub mod constants;
pub mod database;
pub mod document;
pub mod engine;
pub mod error;
pub mod loader;
pub mod message;
pub mod saver;
pub mod security;

pub use chat_history::MssqlChatMessageHistory;
pub use config::{AuthConfig, ConnectorConfig, DatabaseConfig, InstanceConfig, InstanceName, IpType};
pub use database::{CloudSqlConnector, ColumnDef, ConnectInfo, InstanceConnector};
pub use document::Document;
pub use engine::{EngineConnection, MssqlEngine};
pub use error::{ErrorKind, MssqlError, Result};
pub use loader::{DocumentStream, MssqlLoader};
pub use message::{ChatMessage, MessageData, MessageType};
pub use saver::{MssqlDocumentSaver, MssqlDocumentSaverBuilder};
