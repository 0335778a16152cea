//! Write and delete [`Document`]s in a document table.

use crate::constants::{DEFAULT_CONTENT_COLUMN, DEFAULT_METADATA_JSON_COLUMN};
use crate::database::query::ResultRow;
use crate::database::schema::table_columns;
use crate::database::types::SqlValue;
use crate::document::{document_to_row, Document};
use crate::engine::{EngineConnection, MssqlEngine};
use crate::error::MssqlError;
use crate::security::{escape_column_name, safe_identifier};
use std::sync::Arc;
use tiberius::ToSql;
use tracing::debug;

/// Builder for [`MssqlDocumentSaver`].
#[derive(Debug)]
pub struct MssqlDocumentSaverBuilder {
    engine: Arc<MssqlEngine>,
    table_name: String,
    content_column: Option<String>,
    metadata_json_column: Option<String>,
}

impl MssqlDocumentSaverBuilder {
    /// Column receiving the document content (default `page_content`).
    pub fn content_column(mut self, column: impl Into<String>) -> Self {
        self.content_column = Some(column.into());
        self
    }

    /// Column receiving leftover metadata as JSON (default `langchain_metadata`).
    pub fn metadata_json_column(mut self, column: impl Into<String>) -> Self {
        self.metadata_json_column = Some(column.into());
        self
    }

    /// Read the table layout and validate the configured columns.
    pub async fn build(self) -> Result<MssqlDocumentSaver, MssqlError> {
        let table = safe_identifier(&self.table_name)?;
        let context = format!("table '{}'", self.table_name);

        let columns = {
            let mut conn = self.engine.connect().await?;
            table_columns(&mut conn, &self.table_name)
                .await
                .map_err(|e| e.with_context(&context))?
        };
        if columns.is_empty() {
            return Err(MssqlError::object_not_found("Table", &self.table_name));
        }

        let content_column = self
            .content_column
            .unwrap_or_else(|| DEFAULT_CONTENT_COLUMN.to_string());
        if !columns.contains(&content_column) {
            return Err(MssqlError::schema(format!(
                "Missing content column '{}' in table '{}'",
                content_column, self.table_name
            )));
        }

        if let Some(json_column) = &self.metadata_json_column {
            if !columns.contains(json_column) {
                return Err(MssqlError::schema(format!(
                    "Cannot find metadata JSON column '{}' in table '{}'",
                    json_column, self.table_name
                )));
            }
        }
        let metadata_json_column = self
            .metadata_json_column
            .unwrap_or_else(|| DEFAULT_METADATA_JSON_COLUMN.to_string());

        Ok(MssqlDocumentSaver {
            engine: self.engine,
            table_name: self.table_name,
            table,
            columns,
            content_column,
            metadata_json_column,
        })
    }
}

/// Saves documents into, and deletes them from, a document table.
#[derive(Debug, Clone)]
pub struct MssqlDocumentSaver {
    engine: Arc<MssqlEngine>,
    table_name: String,
    table: String,
    columns: Vec<String>,
    content_column: String,
    metadata_json_column: String,
}

impl MssqlDocumentSaver {
    /// Start configuring a saver for `table_name`.
    pub fn builder(
        engine: Arc<MssqlEngine>,
        table_name: impl Into<String>,
    ) -> MssqlDocumentSaverBuilder {
        MssqlDocumentSaverBuilder {
            engine,
            table_name: table_name.into(),
            content_column: None,
            metadata_json_column: None,
        }
    }

    /// Columns of the target table, in definition order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn to_row(&self, doc: &Document) -> Result<ResultRow, MssqlError> {
        document_to_row(
            doc,
            &self.columns,
            &self.content_column,
            &self.metadata_json_column,
        )
    }

    /// INSERT for the columns present in `row`, in table order.
    ///
    /// Column names come from the catalog, so they are only bracket-escaped.
    fn insert_statement<'r>(
        &self,
        row: &'r ResultRow,
    ) -> (String, Vec<&'r SqlValue>) {
        let mut names = Vec::new();
        let mut placeholders = Vec::new();
        let mut values = Vec::new();

        for column in &self.columns {
            if let Some(value) = row.get(column) {
                names.push(escape_column_name(column));
                values.push(value);
                placeholders.push(format!("@P{}", values.len()));
            }
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            names.join(", "),
            placeholders.join(", ")
        );
        (sql, values)
    }

    /// DELETE matching every column of the table; absent values match NULL.
    fn delete_statement<'r>(
        &self,
        row: &'r ResultRow,
    ) -> (String, Vec<&'r SqlValue>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        for column in &self.columns {
            let name = escape_column_name(column);
            match row.get(column).filter(|v| !v.is_null()) {
                Some(value) => {
                    values.push(value);
                    conditions.push(format!("{} = @P{}", name, values.len()));
                }
                None => conditions.push(format!("{} IS NULL", name)),
            }
        }

        let sql = format!("DELETE FROM {} WHERE {}", self.table, conditions.join(" AND "));
        (sql, values)
    }

    async fn run_in_transaction(
        &self,
        conn: &mut EngineConnection<'_>,
        statements: &[(String, Vec<&SqlValue>)],
    ) -> Result<u64, MssqlError> {
        conn.begin_transaction().await?;

        let outcome = async {
            let mut affected = 0;
            for (sql, values) in statements {
                let params: Vec<&dyn ToSql> = values.iter().map(|v| *v as &dyn ToSql).collect();
                affected += conn.execute(sql, &params).await?;
            }
            Ok::<u64, MssqlError>(affected)
        }
        .await;

        conn.finish_transaction(outcome).await
    }

    /// Insert one row per document, all or none.
    pub async fn add_documents(&self, docs: &[Document]) -> Result<(), MssqlError> {
        if docs.is_empty() {
            return Ok(());
        }
        let context = format!("table '{}'", self.table_name);

        let rows = docs
            .iter()
            .map(|doc| self.to_row(doc))
            .collect::<Result<Vec<_>, _>>()?;
        let statements = rows
            .iter()
            .map(|row| self.insert_statement(row))
            .collect::<Vec<_>>();

        let mut conn = self.engine.connect().await?;
        self.run_in_transaction(&mut conn, &statements)
            .await
            .map_err(|e| e.with_context(&context))?;

        debug!("Saved {} documents to {}", docs.len(), context);
        Ok(())
    }

    /// Delete every row that matches a document in all columns.
    ///
    /// Returns the number of rows removed.
    pub async fn delete(&self, docs: &[Document]) -> Result<u64, MssqlError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let context = format!("table '{}'", self.table_name);

        let rows = docs
            .iter()
            .map(|doc| self.to_row(doc))
            .collect::<Result<Vec<_>, _>>()?;
        let statements = rows
            .iter()
            .map(|row| self.delete_statement(row))
            .collect::<Vec<_>>();

        let mut conn = self.engine.connect().await?;
        let removed = self
            .run_in_transaction(&mut conn, &statements)
            .await
            .map_err(|e| e.with_context(&context))?;

        debug!("Deleted {} rows from {}", removed, context);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, DatabaseConfig};

    fn saver(columns: &[&str]) -> MssqlDocumentSaver {
        let engine = Arc::new(MssqlEngine::from_config(DatabaseConfig::new(
            "localhost",
            1433,
            AuthConfig::sql_server("sa", "x"),
        )));
        MssqlDocumentSaver {
            engine,
            table_name: "fruits".to_string(),
            table: "[fruits]".to_string(),
            columns: columns.iter().map(|s| s.to_string()).collect(),
            content_column: DEFAULT_CONTENT_COLUMN.to_string(),
            metadata_json_column: DEFAULT_METADATA_JSON_COLUMN.to_string(),
        }
    }

    #[test]
    fn test_insert_statement_follows_table_order() {
        let saver = saver(&["page_content", "fruit_name", "langchain_metadata"]);
        let doc = Document::new("Apple pie")
            .with_metadata("page", 2)
            .with_metadata("fruit_name", "Apple");
        let row = saver.to_row(&doc).unwrap();

        let (sql, values) = saver.insert_statement(&row);
        assert_eq!(
            sql,
            "INSERT INTO [fruits] ([page_content], [fruit_name], [langchain_metadata]) \
             VALUES (@P1, @P2, @P3)"
        );
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], &SqlValue::String("Apple pie".to_string()));
        assert_eq!(values[2], &SqlValue::String(r#"{"page":2}"#.to_string()));
    }

    #[test]
    fn test_insert_statement_skips_absent_columns() {
        let saver = saver(&["page_content", "fruit_name", "langchain_metadata"]);
        let row = saver.to_row(&Document::new("plain")).unwrap();
        let (sql, values) = saver.insert_statement(&row);
        assert_eq!(sql, "INSERT INTO [fruits] ([page_content]) VALUES (@P1)");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_delete_statement_matches_every_column() {
        let saver = saver(&["page_content", "fruit_name", "langchain_metadata"]);
        let doc = Document::new("Apple pie").with_metadata("fruit_name", "Apple");
        let row = saver.to_row(&doc).unwrap();

        let (sql, values) = saver.delete_statement(&row);
        assert_eq!(
            sql,
            "DELETE FROM [fruits] WHERE [page_content] = @P1 AND [fruit_name] = @P2 \
             AND [langchain_metadata] IS NULL"
        );
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_catalog_column_names_are_bracket_escaped() {
        let saver = saver(&["page_content", "price.usd", "odd]name"]);
        let doc = Document::new("Apple pie")
            .with_metadata("price.usd", 2)
            .with_metadata("odd]name", "x");
        let row = saver.to_row(&doc).unwrap();

        let (sql, values) = saver.insert_statement(&row);
        assert_eq!(
            sql,
            "INSERT INTO [fruits] ([page_content], [price.usd], [odd]]name]) \
             VALUES (@P1, @P2, @P3)"
        );
        assert_eq!(values.len(), 3);

        let (sql, _) = saver.delete_statement(&row);
        assert!(sql.contains("[price.usd] = @P2 AND [odd]]name] = @P3"));
    }

    #[test]
    fn test_delete_statement_null_metadata_value() {
        let saver = saver(&["page_content", "fruit_name"]);
        let doc = Document::new("x").with_metadata("fruit_name", serde_json::Value::Null);
        let row = saver.to_row(&doc).unwrap();
        let (sql, values) = saver.delete_statement(&row);
        assert!(sql.ends_with("[fruit_name] IS NULL"));
        assert_eq!(values.len(), 1);
    }
}
