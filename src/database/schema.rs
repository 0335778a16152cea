//! DDL generation and table introspection.

use crate::constants::CHAT_HISTORY_COLUMNS;
use crate::engine::EngineConnection;
use crate::error::MssqlError;
use crate::security::{quote_literal, safe_identifier, validate_type_name};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A caller-specified column of a document table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,

    /// SQL type, e.g. `NVARCHAR(100)` or `INT`
    pub data_type: String,

    /// Whether NULL is allowed
    pub nullable: bool,
}

impl ColumnDef {
    /// A nullable column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn to_sql(&self) -> Result<String, MssqlError> {
        validate_type_name(&self.data_type)?;
        Ok(format!(
            "{} {}{}",
            safe_identifier(&self.name)?,
            self.data_type.trim(),
            if self.nullable { "" } else { " NOT NULL" }
        ))
    }
}

/// Idempotent CREATE TABLE batch for a chat history table.
pub fn chat_history_table_ddl(table_name: &str) -> Result<String, MssqlError> {
    let table = safe_identifier(table_name)?;
    Ok(format!(
        "IF OBJECT_ID({literal}, N'U') IS NULL \
         BEGIN \
         CREATE TABLE {table} (\
         [id] INT IDENTITY(1,1) PRIMARY KEY, \
         [session_id] NVARCHAR(MAX) NOT NULL, \
         [data] NVARCHAR(MAX) NOT NULL, \
         [type] NVARCHAR(MAX) NOT NULL\
         ) \
         END",
        literal = quote_literal(&table),
        table = table,
    ))
}

/// CREATE TABLE statement for a document table.
pub fn document_table_ddl(
    table_name: &str,
    content_column: &str,
    metadata_columns: &[ColumnDef],
    metadata_json_column: Option<&str>,
) -> Result<String, MssqlError> {
    let table = safe_identifier(table_name)?;

    let mut columns = vec![format!(
        "{} NVARCHAR(MAX) NOT NULL",
        safe_identifier(content_column)?
    )];
    for column in metadata_columns {
        columns.push(column.to_sql()?);
    }
    if let Some(json_column) = metadata_json_column {
        columns.push(format!("{} NVARCHAR(MAX) NULL", safe_identifier(json_column)?));
    }

    Ok(format!("CREATE TABLE {} ({})", table, columns.join(", ")))
}

/// DROP TABLE IF EXISTS statement.
pub fn drop_table_ddl(table_name: &str) -> Result<String, MssqlError> {
    Ok(format!("DROP TABLE IF EXISTS {}", safe_identifier(table_name)?))
}

/// Column names of a user table, in definition order.
///
/// An empty list means the table does not exist.
pub async fn table_columns(
    conn: &mut EngineConnection<'_>,
    table_name: &str,
) -> Result<Vec<String>, MssqlError> {
    let table = safe_identifier(table_name)?;
    let result = conn
        .fetch_all(
            "SELECT name FROM sys.columns WHERE object_id = OBJECT_ID(@P1, N'U') ORDER BY column_id",
            &[&table.as_str()],
        )
        .await?;

    let columns: Vec<String> = result
        .rows
        .iter()
        .filter_map(|row| row.get_str("name").map(str::to_string))
        .collect();

    debug!("Table {} has {} columns", table, columns.len());
    Ok(columns)
}

/// Check that a table has the chat history layout.
pub fn check_chat_history_columns(table_name: &str, columns: &[String]) -> Result<(), MssqlError> {
    if columns.is_empty() {
        return Err(MssqlError::schema(format!(
            "Table '{}' does not exist; create it with init_chat_history_table",
            table_name
        )));
    }

    let missing: Vec<&str> = CHAT_HISTORY_COLUMNS
        .iter()
        .copied()
        .filter(|required| !columns.iter().any(|c| c.eq_ignore_ascii_case(required)))
        .collect();

    if !missing.is_empty() {
        return Err(MssqlError::schema(format!(
            "Table '{}' is missing required columns [{}]; expected columns {:?}",
            table_name,
            missing.join(", "),
            CHAT_HISTORY_COLUMNS
        )));
    }

    Ok(())
}
