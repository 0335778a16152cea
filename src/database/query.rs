//! Query execution and result handling.

use crate::constants::LOG_QUERY_TRUNCATE_LENGTH;
use crate::database::auth::{truncate_for_log, RawConnection};
use crate::database::types::{SqlValue, TypeMapper};
use crate::error::MssqlError;
use futures_util::stream::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tiberius::{QueryItem, QueryStream, Row, ToSql};
use tracing::debug;

/// A single row of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Column values indexed by column name.
    #[serde(flatten)]
    pub columns: HashMap<String, SqlValue>,
}

impl ResultRow {
    /// Create a new result row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a driver row, pairing values with `names` by position.
    pub fn from_row(row: &Row, names: &[String]) -> Self {
        let columns = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), TypeMapper::extract_column(row, idx)))
            .collect();
        Self { columns }
    }

    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    /// Get a non-null string value by column name.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(SqlValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Insert a value.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.insert(column.into(), value);
    }
}

/// Rows of the first result set of a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result rows.
    pub rows: Vec<ResultRow>,
}

/// Run a row-returning statement and collect its first result set.
pub async fn fetch_all(
    conn: &mut RawConnection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<QueryResult, MssqlError> {
    let start = Instant::now();
    debug!(
        "Executing query: {}",
        truncate_for_log(sql, LOG_QUERY_TRUNCATE_LENGTH)
    );

    let stream = conn.query(sql, params).await?;
    let result = process_stream(stream).await?;

    debug!(
        "Query completed: {} rows in {} ms",
        result.rows.len(),
        start.elapsed().as_millis()
    );
    Ok(result)
}

/// Run a statement that modifies data and return the total rows affected.
pub async fn execute(
    conn: &mut RawConnection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<u64, MssqlError> {
    debug!(
        "Executing non-query: {}",
        truncate_for_log(sql, LOG_QUERY_TRUNCATE_LENGTH)
    );

    let result = conn.execute(sql, params).await?;
    let rows_affected = result.rows_affected().iter().sum();

    debug!("Non-query completed: {} rows affected", rows_affected);
    Ok(rows_affected)
}

/// Run parameterless batch text (DDL, transaction control).
pub async fn execute_batch(conn: &mut RawConnection, sql: &str) -> Result<(), MssqlError> {
    debug!(
        "Executing batch: {}",
        truncate_for_log(sql, LOG_QUERY_TRUNCATE_LENGTH)
    );
    conn.simple_query(sql).await?.into_results().await?;
    Ok(())
}

/// Start an explicit transaction on this connection.
pub async fn begin_transaction(conn: &mut RawConnection) -> Result<(), MssqlError> {
    execute_batch(conn, "BEGIN TRANSACTION").await
}

/// Commit the open transaction.
pub async fn commit_transaction(conn: &mut RawConnection) -> Result<(), MssqlError> {
    execute_batch(conn, "COMMIT TRANSACTION").await
}

/// Roll back the open transaction, if the server has not already done so.
pub async fn rollback_transaction(conn: &mut RawConnection) -> Result<(), MssqlError> {
    execute_batch(conn, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
}

/// Process a query stream into a QueryResult. Only the first result set is kept.
async fn process_stream(mut stream: QueryStream<'_>) -> Result<QueryResult, MssqlError> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<ResultRow> = Vec::new();
    let mut result_sets = 0usize;

    while let Some(item) = stream.try_next().await? {
        match item {
            QueryItem::Metadata(meta) => {
                result_sets += 1;
                if result_sets == 1 {
                    columns = meta
                        .columns()
                        .iter()
                        .map(|col| col.name().to_string())
                        .collect();
                }
            }
            QueryItem::Row(row) => {
                if row.result_index() == 0 {
                    rows.push(ResultRow::from_row(&row, &columns));
                }
            }
        }
    }

    Ok(QueryResult { rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_row() {
        let mut row = ResultRow::new();
        row.insert("id", SqlValue::I32(1));
        row.insert("name", SqlValue::String("test".to_string()));

        assert_eq!(
            row.get("id").map(|v| v.to_display_string()),
            Some("1".to_string())
        );
        assert_eq!(row.get_str("name"), Some("test"));
        assert_eq!(row.get_str("id"), None);
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn test_result_row_serializes_flat() {
        let mut row = ResultRow::new();
        row.insert("fruit_name", SqlValue::String("Apple".to_string()));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json, serde_json::json!({"fruit_name": "Apple"}));
    }

    #[test]
    fn test_query_result_default() {
        let result = QueryResult::default();
        assert!(result.rows.is_empty());
    }
}
