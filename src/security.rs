//! Identifier handling for SQL text that cannot use bound parameters.

mod identifiers;

pub use identifiers::{
    escape_column_name, escape_identifier, parse_qualified_name, quote_literal, safe_identifier,
    validate_identifier, validate_type_name, MAX_IDENTIFIER_LENGTH,
};
