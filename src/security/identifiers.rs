//! SQL Server identifier and literal escaping.
//!
//! Table and column names cannot be bound as parameters, so every name that
//! reaches SQL text goes through bracket notation `[identifier]` here.

use crate::error::MssqlError;

/// Maximum length for SQL Server identifiers.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Character sequences that are never accepted inside a caller-supplied name.
const FORBIDDEN_SEQUENCES: [&str; 8] = ["--", "/*", "*/", ";", "'", "\"", "\\", "\x00"];

/// Escape a SQL Server identifier using bracket notation.
///
/// This function handles:
/// - Schema-qualified names (`dbo.messages` -> `[dbo].[messages]`)
/// - Simple names (`messages` -> `[messages]`)
/// - Names that contain brackets (escaped as `]]`)
///
/// # Examples
///
/// ```
/// use cloudsql_mssql::security::escape_identifier;
///
/// assert_eq!(escape_identifier("messages").unwrap(), "[messages]");
/// assert_eq!(escape_identifier("dbo.messages").unwrap(), "[dbo].[messages]");
/// assert_eq!(escape_identifier("chat history").unwrap(), "[chat history]");
/// ```
pub fn escape_identifier(identifier: &str) -> Result<String, MssqlError> {
    if identifier.is_empty() {
        return Err(MssqlError::invalid_identifier("Identifier cannot be empty"));
    }

    let (schema, name) = parse_qualified_name(identifier)?;
    match schema {
        Some(schema) => Ok(format!(
            "{}.{}",
            escape_single_identifier(&schema)?,
            escape_single_identifier(&name)?
        )),
        None => escape_single_identifier(&name),
    }
}

/// Escape a single identifier (no dots).
fn escape_single_identifier(identifier: &str) -> Result<String, MssqlError> {
    let trimmed = identifier.trim();

    if trimmed.is_empty() {
        return Err(MssqlError::invalid_identifier("Identifier cannot be empty"));
    }

    if trimmed.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MssqlError::invalid_identifier(format!(
            "Identifier exceeds maximum length of {} characters",
            MAX_IDENTIFIER_LENGTH
        )));
    }

    // Only strip brackets when both outer brackets exist
    let clean = if trimmed.len() >= 2 && trimmed.starts_with('[') && trimmed.ends_with(']') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    Ok(format!("[{}]", clean.replace(']', "]]")))
}

/// Validate that an identifier contains no dangerous character sequences.
pub fn validate_identifier(identifier: &str) -> Result<(), MssqlError> {
    if identifier.is_empty() {
        return Err(MssqlError::invalid_identifier("Identifier cannot be empty"));
    }

    if identifier.len() > 2 * MAX_IDENTIFIER_LENGTH + 1 {
        return Err(MssqlError::invalid_identifier(format!(
            "Identifier exceeds maximum length of {} characters",
            MAX_IDENTIFIER_LENGTH
        )));
    }

    for pattern in &FORBIDDEN_SEQUENCES {
        if identifier.contains(pattern) {
            return Err(MssqlError::invalid_identifier(format!(
                "Identifier '{}' contains forbidden character sequence: {}",
                identifier, pattern
            )));
        }
    }

    Ok(())
}

/// Bracket-escape a column name read from the catalog.
///
/// The name is used verbatim: no splitting on `.`, no trimming, no
/// validation, since the server already holds it as one identifier.
pub fn escape_column_name(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Validate and escape an identifier for safe use in SQL.
pub fn safe_identifier(identifier: &str) -> Result<String, MssqlError> {
    validate_identifier(identifier)?;
    escape_identifier(identifier)
}

/// Validate a column type expression such as `NVARCHAR(100)` or `DECIMAL(6,2)`.
///
/// Types are spliced into DDL, so only letters, digits, spaces, parentheses
/// and commas are accepted.
pub fn validate_type_name(data_type: &str) -> Result<(), MssqlError> {
    let trimmed = data_type.trim();
    if trimmed.is_empty() {
        return Err(MssqlError::invalid_identifier("Column type cannot be empty"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ' ' | '(' | ')' | ',' | '_');
    if !trimmed.chars().all(allowed) {
        return Err(MssqlError::invalid_identifier(format!(
            "Column type '{}' contains unsupported characters",
            data_type
        )));
    }
    Ok(())
}

/// Quote a value as an N'...' string literal.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Parse a potentially schema-qualified identifier.
///
/// Returns (schema, name) tuple. Schema is None if not specified.
pub fn parse_qualified_name(identifier: &str) -> Result<(Option<String>, String), MssqlError> {
    if identifier.is_empty() {
        return Err(MssqlError::invalid_identifier("Identifier cannot be empty"));
    }

    if let Some((schema, name)) = identifier.split_once('.') {
        if !schema.is_empty() && !name.is_empty() {
            return Ok((Some(schema.to_string()), name.to_string()));
        }
    }

    Ok((None, identifier.to_string()))
}
