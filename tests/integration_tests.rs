//! Integration tests for the SQL Server document loader and chat history.
//!
//! These tests support two modes:
//! 1. **Testcontainers** (default): Automatically spins up SQL Server containers
//! 2. **External server**: Connect to existing server via MSSQL_HOST env var
//!
//! ## Running with testcontainers (requires Docker):
//! ```bash
//! cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! ## Running against external server (e.g., CI service container):
//! ```bash
//! MSSQL_HOST=localhost MSSQL_PORT=1433 MSSQL_PASSWORD='yourPass' \
//!   cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! Note: SQL Server container requires ~2GB RAM and takes 30-60 seconds to start.

use cloudsql_mssql::database::query::{execute, fetch_all};
use cloudsql_mssql::database::SqlValue;
use cloudsql_mssql::{
    AuthConfig, ChatMessage, ColumnDef, DatabaseConfig, Document, ErrorKind, MessageType,
    MssqlChatMessageHistory, MssqlDocumentSaver, MssqlEngine, MssqlError, MssqlLoader,
};
use futures_util::TryStreamExt;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mssql_server::MssqlServer;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;

/// Default SA password for testcontainers.
const DEFAULT_SA_PASSWORD: &str = "yourStrong(!)Password";

/// Default SQL Server image tag for tests.
const DEFAULT_VERSION: &str = "2022-latest";

/// Get the SQL Server version to test against.
fn get_test_version() -> String {
    std::env::var("MSSQL_TEST_VERSION").unwrap_or_else(|_| DEFAULT_VERSION.to_string())
}

/// Check if we should use an external server (vs testcontainers).
fn use_external_server() -> bool {
    std::env::var("MSSQL_HOST").is_ok()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A table name no other test run uses.
fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Test database connection source.
#[allow(dead_code)] // Variants held for lifetime management (Drop trait)
enum TestDatabaseSource {
    /// External server configured via environment variables.
    External,
    /// Testcontainer-managed SQL Server (boxed to reduce enum size).
    Container(Box<ContainerAsync<MssqlServer>>),
}

/// Helper struct to manage the test database connection.
struct TestDatabase {
    #[allow(dead_code)] // Held for lifetime management (Drop trait on Container)
    source: TestDatabaseSource,
    host: String,
    port: u16,
    password: String,
}

impl TestDatabase {
    /// Uses external server if MSSQL_HOST is set, otherwise uses testcontainers.
    async fn new() -> Self {
        init_tracing();
        if use_external_server() {
            Self::from_external()
        } else {
            Self::from_testcontainer(&get_test_version()).await
        }
    }

    fn from_external() -> Self {
        let host = std::env::var("MSSQL_HOST").expect("MSSQL_HOST must be set");
        let port = std::env::var("MSSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1433);
        let password =
            std::env::var("MSSQL_PASSWORD").unwrap_or_else(|_| DEFAULT_SA_PASSWORD.to_string());

        eprintln!("Using external SQL Server at {}:{}", host, port);

        Self {
            source: TestDatabaseSource::External,
            host,
            port,
            password,
        }
    }

    async fn from_testcontainer(version: &str) -> Self {
        eprintln!("Starting SQL Server {} container via testcontainers...", version);

        let container = MssqlServer::default()
            .with_accept_eula()
            .with_tag(version)
            .start()
            .await
            .unwrap_or_else(|e| panic!("Failed to start SQL Server {} container: {}", version, e));

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(1433)
            .await
            .expect("Failed to get port");

        // Wait a bit for SQL Server to fully initialize
        tokio::time::sleep(Duration::from_secs(5)).await;

        Self {
            source: TestDatabaseSource::Container(Box::new(container)),
            host: host.to_string(),
            port,
            password: DEFAULT_SA_PASSWORD.to_string(),
        }
    }

    fn config(&self) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(
            self.host.clone(),
            self.port,
            AuthConfig::sql_server("sa", self.password.clone()),
        )
        .with_database("master");
        config.encrypt = true;
        config.trust_server_certificate = true;
        config
    }

    /// An engine that opens its own connection on first use.
    fn engine(&self) -> Arc<MssqlEngine> {
        Arc::new(MssqlEngine::from_config(self.config()))
    }

    /// A tiberius client built outside the crate.
    async fn raw_client(&self) -> Client<tokio_util::compat::Compat<TcpStream>> {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.authentication(tiberius::AuthMethod::sql_server("sa", &self.password));
        config.trust_cert();

        let tcp = TcpStream::connect(format!("{}:{}", self.host, self.port))
            .await
            .expect("Failed to connect to TCP");
        tcp.set_nodelay(true).expect("Failed to set TCP_NODELAY");

        Client::connect(config, tcp.compat_write())
            .await
            .expect("Failed to connect to SQL Server")
    }
}

async fn run_batch(engine: &MssqlEngine, sql: &str) {
    let mut conn = engine.connect().await.expect("connect failed");
    conn.simple_query(sql)
        .await
        .expect("batch failed")
        .into_results()
        .await
        .expect("batch results failed");
}

// =============================================================================
// Engine Tests
// =============================================================================

mod engine_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_engine_connects_lazily_and_reconnects() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        assert!(!engine.is_connected().await);

        {
            let mut conn = engine.connect().await.unwrap();
            let result = fetch_all(&mut conn, "SELECT 1 AS one", &[]).await.unwrap();
            assert_eq!(result.rows[0].get("one"), Some(&SqlValue::I32(1)));
        }
        assert!(engine.is_connected().await);

        engine.close().await.unwrap();
        assert!(!engine.is_connected().await);

        // Engines built from configuration reopen on demand.
        let mut conn = engine.connect().await.unwrap();
        let result = fetch_all(&mut conn, "SELECT 2 AS two", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_from_connection_cannot_reopen() {
        let db = TestDatabase::new().await;
        let engine = MssqlEngine::from_connection(db.raw_client().await);

        assert!(engine.connect().await.is_ok());
        engine.close().await.unwrap();

        let err = engine.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_killed_session_is_replaced() {
        let db = TestDatabase::new().await;
        let engine = db.engine();

        let spid = {
            let mut conn = engine.connect().await.unwrap();
            let result = conn
                .fetch_all("SELECT CAST(@@SPID AS INT) AS spid", &[])
                .await
                .unwrap();
            match result.rows[0].get("spid") {
                Some(SqlValue::I32(id)) => *id,
                other => panic!("unexpected session id {:?}", other),
            }
        };

        let mut admin = db.raw_client().await;
        admin
            .simple_query(format!("KILL {}", spid))
            .await
            .unwrap()
            .into_results()
            .await
            .unwrap();

        {
            let mut conn = engine.connect().await.unwrap();
            let err = conn.fetch_all("SELECT 1 AS one", &[]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Connection);
        }
        assert!(!engine.is_connected().await);

        // The dead client is dropped and a new session opened.
        let mut conn = engine.connect().await.unwrap();
        let result = conn.fetch_all("SELECT 1 AS one", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_abandoned_transaction_is_rolled_back() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");
        engine.init_chat_history_table(&table).await.unwrap();

        let insert = format!(
            "INSERT INTO [{}] (session_id, data, type) VALUES (N'abc', N'{{\"content\": \"x\"}}', N'human')",
            table
        );
        {
            let mut conn = engine.connect().await.unwrap();
            conn.begin_transaction().await.unwrap();
            conn.execute(&insert, &[]).await.unwrap();
            // Guard dropped without finish_transaction.
        }

        let mut conn = engine.connect().await.unwrap();
        let depth = conn.fetch_all("SELECT @@TRANCOUNT AS depth", &[]).await.unwrap();
        assert_eq!(depth.rows[0].get("depth"), Some(&SqlValue::I32(0)));

        let count = conn
            .fetch_all(&format!("SELECT COUNT(*) AS n FROM [{}]", table), &[])
            .await
            .unwrap();
        assert_eq!(count.rows[0].get("n"), Some(&SqlValue::I32(0)));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_failed_batch_commits_nothing() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");
        engine.init_chat_history_table(&table).await.unwrap();
        let history = MssqlChatMessageHistory::new(engine.clone(), &table, "abc")
            .await
            .unwrap();

        {
            let mut conn = engine.connect().await.unwrap();
            conn.begin_transaction().await.unwrap();
            let err = conn
                .execute("INSERT INTO [no_such_table_here] (x) VALUES (1)", &[])
                .await
                .unwrap_err();
            let err = conn.finish_transaction::<()>(Err(err)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Query);
        }

        // The shared connection is back in autocommit mode.
        history.add_user_message("after the failure").await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(history.messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_wrong_password_is_connection_error() {
        let db = TestDatabase::new().await;
        let mut config = db.config();
        config.auth = AuthConfig::sql_server("sa", "definitely-wrong");
        let engine = MssqlEngine::from_config(config);

        let err = engine.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}

// =============================================================================
// Chat History Tests
// =============================================================================

mod chat_history_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_history_end_to_end() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");
        engine.init_chat_history_table(&table).await.unwrap();

        let history = MssqlChatMessageHistory::new(engine.clone(), &table, "abc")
            .await
            .unwrap();

        history.add_message(&ChatMessage::human("hi!")).await.unwrap();
        history.add_message(&ChatMessage::ai("whats up?")).await.unwrap();
        history.add_message(&ChatMessage::human("not much")).await.unwrap();

        let messages = history.messages().await.unwrap();
        assert_eq!(
            messages,
            vec![
                ChatMessage::human("hi!"),
                ChatMessage::ai("whats up?"),
                ChatMessage::human("not much"),
            ]
        );

        assert_eq!(history.clear().await.unwrap(), 3);
        assert!(history.messages().await.unwrap().is_empty());

        // Clearing twice is harmless.
        assert_eq!(history.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_clear_only_affects_own_session() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");
        engine.init_chat_history_table(&table).await.unwrap();

        let alice = MssqlChatMessageHistory::new(engine.clone(), &table, "alice")
            .await
            .unwrap();
        let bob = MssqlChatMessageHistory::new(engine.clone(), &table, "bob")
            .await
            .unwrap();

        alice.add_user_message("from alice").await.unwrap();
        bob.add_user_message("from bob").await.unwrap();
        bob.add_ai_message("reply to bob").await.unwrap();

        alice.clear().await.unwrap();

        assert!(alice.messages().await.unwrap().is_empty());
        let bob_messages = bob.messages().await.unwrap();
        assert_eq!(bob_messages.len(), 2);
        assert_eq!(bob_messages[0].content(), "from bob");
        assert_eq!(bob_messages[1].message_type(), MessageType::Ai);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_init_twice_keeps_rows() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");

        engine.init_chat_history_table(&table).await.unwrap();
        let history = MssqlChatMessageHistory::new(engine.clone(), &table, "abc")
            .await
            .unwrap();
        history.add_user_message("persist me").await.unwrap();

        engine.init_chat_history_table(&table).await.unwrap();
        assert_eq!(history.messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_every_message_type_round_trips() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");
        engine.init_chat_history_table(&table).await.unwrap();
        let history = MssqlChatMessageHistory::new(engine, &table, "types")
            .await
            .unwrap();

        let mut ai = ChatMessage::ai("calling a tool");
        ai.data_mut()
            .additional_kwargs
            .insert("tool_calls".to_string(), json!([{"id": "call_1", "name": "weather"}]));

        let sent = vec![
            ChatMessage::system("be brief"),
            ChatMessage::human("weather?"),
            ai,
            ChatMessage::tool("call_1", "sunny"),
            ChatMessage::function("weather", "sunny"),
            ChatMessage::chat("narrator", "the end"),
        ];
        history.add_messages(&sent).await.unwrap();

        assert_eq!(history.messages().await.unwrap(), sent);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_unknown_type_is_decode_error() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("message_store");
        engine.init_chat_history_table(&table).await.unwrap();

        {
            let mut conn = engine.connect().await.unwrap();
            let sql = format!(
                "INSERT INTO [{}] (session_id, data, type) VALUES (@P1, @P2, @P3)",
                table
            );
            execute(&mut conn, &sql, &[&"abc", &r#"{"content": "beep"}"#, &"robot"])
                .await
                .unwrap();
        }

        let history = MssqlChatMessageHistory::new(engine, &table, "abc")
            .await
            .unwrap();
        let err = history.messages().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("robot"));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_schema_verification() {
        let db = TestDatabase::new().await;
        let engine = db.engine();

        let missing = unique_table("missing");
        let err = MssqlChatMessageHistory::new(engine.clone(), &missing, "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, MssqlError::Schema(_)));
        assert_eq!(err.kind(), ErrorKind::Query);

        let wrong = unique_table("wrong_shape");
        run_batch(
            &engine,
            &format!("CREATE TABLE [{}] (id INT, session_id NVARCHAR(50))", wrong),
        )
        .await;
        let err = MssqlChatMessageHistory::new(engine, &wrong, "abc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("data"));
    }
}

// =============================================================================
// Loader Tests
// =============================================================================

mod loader_tests {
    use super::*;

    async fn fruit_table(engine: &MssqlEngine) -> String {
        let table = unique_table("fruits");
        run_batch(
            engine,
            &format!(
                "CREATE TABLE [{t}] (
                    fruit_id INT IDENTITY(1,1) PRIMARY KEY,
                    fruit_name NVARCHAR(100) NOT NULL,
                    variety NVARCHAR(100),
                    quantity_in_stock INT NOT NULL,
                    price_per_unit DECIMAL(6,2) NOT NULL,
                    organic BIT NOT NULL
                );
                INSERT INTO [{t}] (fruit_name, variety, quantity_in_stock, price_per_unit, organic)
                VALUES
                    (N'Apple', N'Granny Smith', 150, 0.99, 1),
                    (N'Banana', N'Cavendish', 200, 0.59, 0),
                    (N'Orange', N'Navel', 80, 1.29, 1);",
                t = table
            ),
        )
        .await;
        table
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_load_with_default_columns() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = fruit_table(&engine).await;

        let docs = MssqlLoader::from_table(engine, &table).load().await.unwrap();
        assert_eq!(docs.len(), 3);

        assert_eq!(docs[0].content, "1");
        assert_eq!(
            serde_json::Value::Object(docs[0].metadata.clone()),
            json!({
                "fruit_name": "Apple",
                "variety": "Granny Smith",
                "quantity_in_stock": 150,
                "price_per_unit": 0.99,
                "organic": true
            })
        );
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_load_with_selected_columns() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = fruit_table(&engine).await;

        let docs = MssqlLoader::from_table(engine, &table)
            .with_content_columns(["fruit_name", "variety"])
            .with_metadata_columns(["fruit_id", "organic"])
            .load()
            .await
            .unwrap();

        assert_eq!(docs[1].content, "Banana Cavendish");
        assert_eq!(
            serde_json::Value::Object(docs[1].metadata.clone()),
            json!({"fruit_id": 2, "organic": false})
        );
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_lazy_load_restarts_per_call() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = fruit_table(&engine).await;

        let loader = MssqlLoader::from_query(
            engine.clone(),
            format!("SELECT fruit_name FROM [{}] ORDER BY fruit_id", table),
        );

        let mut conn = engine.connect().await.unwrap();
        for _ in 0..2 {
            let mut stream = loader.lazy_load(&mut conn).await.unwrap();
            let first = stream.try_next().await.unwrap().unwrap();
            assert_eq!(first.content, "Apple");
            let rest: Vec<Document> = stream.try_collect().await.unwrap();
            assert_eq!(rest.len(), 2);
        }
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_unknown_column_is_query_error() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = fruit_table(&engine).await;

        let err = MssqlLoader::from_table(engine.clone(), &table)
            .with_content_columns(["color"])
            .load()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);

        let err = MssqlLoader::from_table(engine, unique_table("missing"))
            .load()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_json_metadata_column() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("docs");
        run_batch(
            &engine,
            &format!(
                "CREATE TABLE [{t}] (page_content NVARCHAR(MAX), source NVARCHAR(100),
                    langchain_metadata NVARCHAR(MAX));
                 INSERT INTO [{t}] VALUES
                    (N'hello', N'column', N'{{\"source\": \"json\", \"page\": 3}}');",
                t = table
            ),
        )
        .await;

        let docs = MssqlLoader::from_table(engine, &table).load().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "hello");
        assert_eq!(
            serde_json::Value::Object(docs[0].metadata.clone()),
            json!({"source": "column", "page": 3})
        );
    }
}

// =============================================================================
// Document Saver Tests
// =============================================================================

mod saver_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_save_load_delete() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("saved_docs");

        engine
            .init_document_table(
                &table,
                &[ColumnDef::new("fruit_name", "NVARCHAR(100)")],
                "page_content",
                Some("langchain_metadata"),
                false,
            )
            .await
            .unwrap();

        let saver = MssqlDocumentSaver::builder(engine.clone(), &table)
            .build()
            .await
            .unwrap();

        let docs = vec![
            Document::new("Apple pie")
                .with_metadata("fruit_name", "Apple")
                .with_metadata("page", 1),
            Document::new("Banana bread").with_metadata("fruit_name", "Banana"),
        ];
        saver.add_documents(&docs).await.unwrap();

        let loaded = MssqlLoader::from_table(engine.clone(), &table)
            .load()
            .await
            .unwrap();
        assert_eq!(loaded, docs);

        assert_eq!(saver.delete(&docs[..1]).await.unwrap(), 1);
        let remaining = MssqlLoader::from_table(engine, &table).load().await.unwrap();
        assert_eq!(remaining, docs[1..].to_vec());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_init_document_table_overwrite() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("saved_docs");

        engine
            .init_document_table(&table, &[], "page_content", None, false)
            .await
            .unwrap();

        let err = engine
            .init_document_table(&table, &[], "page_content", None, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);

        engine
            .init_document_table(&table, &[], "page_content", None, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_builder_validates_columns() {
        let db = TestDatabase::new().await;
        let engine = db.engine();
        let table = unique_table("saved_docs");
        engine
            .init_document_table(&table, &[], "body", None, false)
            .await
            .unwrap();

        let err = MssqlDocumentSaver::builder(engine.clone(), &table)
            .build()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("page_content"));

        let err = MssqlDocumentSaver::builder(engine.clone(), &table)
            .content_column("body")
            .metadata_json_column("meta")
            .build()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("meta"));

        assert!(MssqlDocumentSaver::builder(engine, &table)
            .content_column("body")
            .build()
            .await
            .is_ok());
    }
}
