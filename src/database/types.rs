//! SQL Server type mapping to Rust and JSON values.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use tiberius::{ColumnData, Row, ToSql};
use uuid::Uuid;

/// A SQL value that can be serialized to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Decimal(Decimal),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Convert to a display string.
    pub fn to_display_string(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::U8(v) => v.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::String(v) => v.clone(),
            SqlValue::Bytes(v) => format!("0x{}", hex::encode(v)),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Uuid(v) => v.to_string(),
            SqlValue::Date(v) => v.to_string(),
            SqlValue::Time(v) => v.to_string(),
            SqlValue::DateTime(v) => v.to_string(),
            SqlValue::DateTimeUtc(v) => v.to_rfc3339(),
        }
    }

    /// Convert to a JSON value for document metadata.
    ///
    /// Numbers stay numbers (DECIMAL included, as the nearest f64); temporal
    /// values, GUIDs and binary data become strings.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(v) => Value::Bool(*v),
            SqlValue::U8(v) => Value::from(*v),
            SqlValue::I16(v) => Value::from(*v),
            SqlValue::I32(v) => Value::from(*v),
            SqlValue::I64(v) => Value::from(*v),
            SqlValue::F32(v) => float_to_json(f64::from(*v)),
            SqlValue::F64(v) => float_to_json(*v),
            SqlValue::String(v) => Value::String(v.clone()),
            SqlValue::Decimal(v) => match (v.scale(), v.to_i64()) {
                (0, Some(i)) => Value::from(i),
                _ => v
                    .to_f64()
                    .map(float_to_json)
                    .unwrap_or_else(|| Value::String(v.to_string())),
            },
            other => Value::String(other.to_display_string()),
        }
    }

    /// Convert a JSON value into a bindable SQL value.
    ///
    /// Arrays and objects are stored as their JSON text.
    pub fn from_json(value: &Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::I64(i)
                } else {
                    n.as_f64().map(SqlValue::F64).unwrap_or(SqlValue::Null)
                }
            }
            Value::String(s) => SqlValue::String(s.clone()),
            other => SqlValue::String(other.to_string()),
        }
    }
}

fn float_to_json(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            // Untyped NULL; the server converts it to the target column type.
            SqlValue::Null => ColumnData::String(None),
            SqlValue::Bool(v) => v.to_sql(),
            SqlValue::U8(v) => v.to_sql(),
            SqlValue::I16(v) => v.to_sql(),
            SqlValue::I32(v) => v.to_sql(),
            SqlValue::I64(v) => v.to_sql(),
            SqlValue::F32(v) => v.to_sql(),
            SqlValue::F64(v) => v.to_sql(),
            SqlValue::String(v) => ColumnData::String(Some(Cow::Borrowed(v.as_str()))),
            SqlValue::Bytes(v) => ColumnData::Binary(Some(Cow::Borrowed(v.as_slice()))),
            SqlValue::Decimal(v) => v.to_sql(),
            SqlValue::Uuid(v) => v.to_sql(),
            SqlValue::Date(v) => v.to_sql(),
            SqlValue::Time(v) => v.to_sql(),
            SqlValue::DateTime(v) => v.to_sql(),
            SqlValue::DateTimeUtc(v) => v.to_sql(),
        }
    }
}

/// Type mapper for converting SQL Server columns to [`SqlValue`]s.
pub struct TypeMapper;

impl TypeMapper {
    /// Extract a value from a Tiberius row column.
    pub fn extract_column(row: &Row, idx: usize) -> SqlValue {
        if row.columns().get(idx).is_none() {
            return SqlValue::Null;
        }

        // Strings (most common)
        if let Some(v) = row.try_get::<&str, _>(idx).ok().flatten() {
            return SqlValue::String(v.to_string());
        }

        // Integers
        if let Some(v) = row.try_get::<i32, _>(idx).ok().flatten() {
            return SqlValue::I32(v);
        }
        if let Some(v) = row.try_get::<i64, _>(idx).ok().flatten() {
            return SqlValue::I64(v);
        }
        if let Some(v) = row.try_get::<i16, _>(idx).ok().flatten() {
            return SqlValue::I16(v);
        }
        // TINYINT is unsigned in SQL Server
        if let Some(v) = row.try_get::<u8, _>(idx).ok().flatten() {
            return SqlValue::U8(v);
        }

        // Floating point
        if let Some(v) = row.try_get::<f64, _>(idx).ok().flatten() {
            return SqlValue::F64(v);
        }
        if let Some(v) = row.try_get::<f32, _>(idx).ok().flatten() {
            return SqlValue::F32(v);
        }

        // Decimal
        if let Some(v) = row.try_get::<Decimal, _>(idx).ok().flatten() {
            return SqlValue::Decimal(v);
        }

        // Boolean
        if let Some(v) = row.try_get::<bool, _>(idx).ok().flatten() {
            return SqlValue::Bool(v);
        }

        // UUID
        if let Some(v) = row.try_get::<Uuid, _>(idx).ok().flatten() {
            return SqlValue::Uuid(v);
        }

        // Date/Time types
        if let Some(v) = row.try_get::<DateTime<Utc>, _>(idx).ok().flatten() {
            return SqlValue::DateTimeUtc(v);
        }
        if let Some(v) = row.try_get::<NaiveDateTime, _>(idx).ok().flatten() {
            return SqlValue::DateTime(v);
        }
        if let Some(v) = row.try_get::<NaiveDate, _>(idx).ok().flatten() {
            return SqlValue::Date(v);
        }
        if let Some(v) = row.try_get::<NaiveTime, _>(idx).ok().flatten() {
            return SqlValue::Time(v);
        }

        // Binary
        if let Some(v) = row.try_get::<&[u8], _>(idx).ok().flatten() {
            return SqlValue::Bytes(v.to_vec());
        }

        // NULLs and unsupported types
        SqlValue::Null
    }
}

/// Hex encoding helper (minimal implementation to avoid extra dependency).
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02X}", b)).collect()
    }
}
