//! Documents and their mapping to and from table rows.

use crate::constants::DEFAULT_METADATA_JSON_COLUMN;
use crate::database::query::ResultRow;
use crate::database::types::SqlValue;
use crate::error::MssqlError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A unit of text plus arbitrary metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Text body
    pub content: String,

    /// Key/value metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    /// A document with no metadata.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Which result columns feed a document's content and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnPlan {
    content_columns: Vec<String>,
    metadata_columns: Vec<String>,
    metadata_json_column: Option<String>,
}

impl ColumnPlan {
    /// Resolve the caller's selection against the columns a query returned.
    ///
    /// Unspecified content defaults to the first column that is not a metadata
    /// column; unspecified metadata defaults to every non-content column. The
    /// JSON metadata column is the configured one, or `langchain_metadata`
    /// when the result has it. An empty list counts as unspecified.
    pub fn resolve(
        result_columns: &[String],
        content_columns: Option<&[String]>,
        metadata_columns: Option<&[String]>,
        metadata_json_column: Option<&str>,
    ) -> Result<Self, MssqlError> {
        let content_columns = content_columns.filter(|c| !c.is_empty());
        let metadata_columns = metadata_columns.filter(|m| !m.is_empty());
        let has = |name: &str| result_columns.iter().any(|c| c == name);
        let missing = |name: &str| {
            MssqlError::object_not_found(
                "Column",
                format!("{} in query result {:?}", name, result_columns),
            )
        };

        let metadata_json_column = match metadata_json_column {
            Some(name) if !has(name) => return Err(missing(name)),
            Some(name) => Some(name.to_string()),
            None if has(DEFAULT_METADATA_JSON_COLUMN) => {
                Some(DEFAULT_METADATA_JSON_COLUMN.to_string())
            }
            None => None,
        };

        let content_columns: Vec<String> = match content_columns {
            Some(columns) => columns.to_vec(),
            None => {
                let first = result_columns
                    .iter()
                    .find(|c| {
                        metadata_json_column.as_deref() != Some(c.as_str())
                            && !metadata_columns.is_some_and(|m| m.contains(c))
                    })
                    .ok_or_else(|| {
                        MssqlError::query_error(format!(
                            "No column left for document content in query result {:?}",
                            result_columns
                        ))
                    })?;
                vec![first.clone()]
            }
        };

        let metadata_columns: Vec<String> = match metadata_columns {
            Some(columns) => columns.to_vec(),
            None => result_columns
                .iter()
                .filter(|c| !content_columns.contains(c))
                .cloned()
                .collect(),
        };

        if let Some(name) = content_columns
            .iter()
            .chain(metadata_columns.iter())
            .find(|name| !has(name))
        {
            return Err(missing(name));
        }

        Ok(Self {
            content_columns,
            metadata_columns,
            metadata_json_column,
        })
    }

    /// Build a document from one result row.
    pub fn to_document(&self, row: &ResultRow) -> Result<Document, MssqlError> {
        let content = self
            .content_columns
            .iter()
            .filter_map(|c| row.get(c))
            .filter(|v| !v.is_null())
            .map(SqlValue::to_display_string)
            .collect::<Vec<_>>()
            .join(" ");

        let mut metadata = Map::new();

        if let Some(json_column) = &self.metadata_json_column {
            match row.get(json_column) {
                Some(SqlValue::String(text)) => match serde_json::from_str::<Value>(text)? {
                    Value::Object(entries) => metadata.extend(entries),
                    Value::Null => {}
                    other => {
                        return Err(MssqlError::decode(format!(
                            "Column '{}' must hold a JSON object, found {}",
                            json_column, other
                        )))
                    }
                },
                Some(SqlValue::Null) | None => {}
                Some(other) => {
                    return Err(MssqlError::decode(format!(
                        "Column '{}' must hold JSON text, found {:?}",
                        json_column, other
                    )))
                }
            }
        }

        for column in &self.metadata_columns {
            if Some(column) == self.metadata_json_column.as_ref() {
                continue;
            }
            if let Some(value) = row.get(column) {
                metadata.insert(column.clone(), value.to_json());
            }
        }

        Ok(Document { content, metadata })
    }
}

/// Split a document into column values for a table with `table_columns`.
///
/// Metadata keys naming a table column go into that column; everything else
/// is JSON-encoded into `metadata_json_column` when the table has it.
pub(crate) fn document_to_row(
    doc: &Document,
    table_columns: &[String],
    content_column: &str,
    metadata_json_column: &str,
) -> Result<ResultRow, MssqlError> {
    let mut row = ResultRow::new();
    row.insert(content_column, SqlValue::String(doc.content.clone()));

    let mut extra = Map::new();
    for (key, value) in &doc.metadata {
        let is_plain_column = key != content_column
            && key != metadata_json_column
            && table_columns.iter().any(|c| c == key);
        if is_plain_column {
            row.insert(key.clone(), SqlValue::from_json(value));
        } else if key != content_column {
            extra.insert(key.clone(), value.clone());
        }
    }

    let has_json_column = table_columns.iter().any(|c| c == metadata_json_column);
    if has_json_column && !extra.is_empty() {
        let json = serde_json::to_string(&Value::Object(extra))
            .map_err(|e| MssqlError::invalid_input(format!("Unserializable metadata: {}", e)))?;
        row.insert(metadata_json_column, SqlValue::String(json));
    }

    Ok(row)
}
