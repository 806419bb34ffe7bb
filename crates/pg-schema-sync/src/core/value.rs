//! Row values moved by the data migration engine.
//!
//! Values are fetched from the source either natively (booleans, integers,
//! UUIDs, bytea, arrays) or as their text form, and rendered back as SQL
//! literals for multi-row INSERT statements. Text literals are left untyped
//! so the server coerces them to the target column type. JSON documents
//! travel as their exact source text.

use uuid::Uuid;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Uuid(Uuid),
    /// Text form of any scalar or document (numeric, timestamps, enums, json).
    Text(String),
    Bytes(Vec<u8>),
    /// One-dimensional array with text elements.
    Array(Vec<Option<String>>),
}

impl SqlValue {
    /// Render as a SQL literal.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::Int(n) => n.to_string(),
            SqlValue::Uuid(u) => format!("'{}'", u),
            SqlValue::Text(s) => format!("'{}'", escape_sql_string(s)),
            SqlValue::Bytes(b) => format!("'\\x{}'", hex::encode(b)),
            SqlValue::Array(items) => format!("'{}'", escape_sql_string(&array_literal(items))),
        }
    }
}

/// Escape a string for use inside single quotes.
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// PostgreSQL array input syntax: `{"a","b",NULL}`.
///
/// Every element is double-quoted with backslashes and quotes escaped, so
/// commas, braces and the word NULL inside elements survive.
pub fn array_literal(items: &[Option<String>]) -> String {
    let body = items
        .iter()
        .map(|item| match item {
            None => "NULL".to_string(),
            Some(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", body)
}
