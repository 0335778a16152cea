//! Load table rows or query results as [`Document`]s.

use crate::constants::LOG_QUERY_TRUNCATE_LENGTH;
use crate::database::auth::truncate_for_log;
use crate::database::query::ResultRow;
use crate::database::RawConnection;
use crate::document::{ColumnPlan, Document};
use crate::engine::MssqlEngine;
use crate::error::MssqlError;
use crate::security::safe_identifier;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

/// Stream of documents borrowing an engine connection.
pub type DocumentStream<'c> = BoxStream<'c, Result<Document, MssqlError>>;

#[derive(Debug, Clone)]
enum Source {
    Table(String),
    Query(String),
}

/// Loads documents from a SQL Server table or query.
#[derive(Debug, Clone)]
pub struct MssqlLoader {
    engine: Arc<MssqlEngine>,
    source: Source,
    content_columns: Option<Vec<String>>,
    metadata_columns: Option<Vec<String>>,
    metadata_json_column: Option<String>,
}

impl MssqlLoader {
    /// Load every row of `table_name`.
    pub fn from_table(engine: Arc<MssqlEngine>, table_name: impl Into<String>) -> Self {
        Self::new(engine, Source::Table(table_name.into()))
    }

    /// Load the rows of an arbitrary query. The query text is sent as-is.
    pub fn from_query(engine: Arc<MssqlEngine>, query: impl Into<String>) -> Self {
        Self::new(engine, Source::Query(query.into()))
    }

    fn new(engine: Arc<MssqlEngine>, source: Source) -> Self {
        Self {
            engine,
            source,
            content_columns: None,
            metadata_columns: None,
            metadata_json_column: None,
        }
    }

    /// Columns joined (space-separated) into the document content.
    pub fn with_content_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Columns copied into the document metadata.
    pub fn with_metadata_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Column holding a JSON object merged into the metadata first.
    pub fn with_metadata_json_column(mut self, column: impl Into<String>) -> Self {
        self.metadata_json_column = Some(column.into());
        self
    }

    fn query_text(&self) -> Result<String, MssqlError> {
        match &self.source {
            Source::Table(table) => Ok(format!("SELECT * FROM {}", safe_identifier(table)?)),
            Source::Query(query) => Ok(query.clone()),
        }
    }

    fn context(&self) -> String {
        match &self.source {
            Source::Table(table) => format!("table '{}'", table),
            Source::Query(query) => format!(
                "query '{}'",
                truncate_for_log(query, LOG_QUERY_TRUNCATE_LENGTH)
            ),
        }
    }

    /// Load all documents into memory.
    pub async fn load(&self) -> Result<Vec<Document>, MssqlError> {
        let mut conn = self.engine.connect().await?;
        let loaded = match self.lazy_load(&mut conn).await {
            Ok(stream) => stream.try_collect::<Vec<Document>>().await,
            Err(e) => Err(e),
        };
        let documents = conn.track(loaded)?;
        debug!("Loaded {} documents from {}", documents.len(), self.context());
        Ok(documents)
    }

    /// Stream documents one row at a time over `conn`.
    ///
    /// The query is issued on every call, so each stream starts from the
    /// first row. Pass the guard from [`MssqlEngine::connect`]; report stream
    /// failures back with [`EngineConnection::track`](crate::EngineConnection::track).
    pub async fn lazy_load<'c>(
        &self,
        conn: &'c mut RawConnection,
    ) -> Result<DocumentStream<'c>, MssqlError> {
        let context = self.context();
        let sql = self.query_text().map_err(|e| e.with_context(&context))?;

        debug!(
            "Loading documents: {}",
            truncate_for_log(&sql, LOG_QUERY_TRUNCATE_LENGTH)
        );

        let mut stream = conn
            .simple_query(sql)
            .await
            .map_err(|e| MssqlError::from(e).with_context(&context))?;

        let columns: Vec<String> = match stream
            .columns()
            .await
            .map_err(|e| MssqlError::from(e).with_context(&context))?
        {
            Some(columns) => columns.iter().map(|c| c.name().to_string()).collect(),
            None => {
                return Err(
                    MssqlError::query_error("Statement returned no result set")
                        .with_context(&context),
                )
            }
        };

        let plan = ColumnPlan::resolve(
            &columns,
            self.content_columns.as_deref(),
            self.metadata_columns.as_deref(),
            self.metadata_json_column.as_deref(),
        )
        .map_err(|e| e.with_context(&context))?;

        let documents = stream.into_row_stream().map(move |row| {
            let row = row.map_err(|e| MssqlError::from(e).with_context(&context))?;
            plan.to_document(&ResultRow::from_row(&row, &columns))
                .map_err(|e| e.with_context(&context))
        });

        Ok(documents.boxed())
    }
}
