//! Identifier validation and quoting for dynamically built SQL.
//!
//! Identifiers cannot be bound as statement parameters, so every table,
//! column and constraint name that reaches generated DDL goes through one of
//! these helpers.

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers to 63 bytes (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Words that must stay quoted even when they look like plain identifiers.
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false",
    "fetch", "for", "foreign", "from", "grant", "group", "having", "in", "initially",
    "intersect", "into", "lateral", "leading", "limit", "localtime", "localtimestamp", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "table", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "variadic", "when", "where",
    "window", "with",
];

/// Validate a configured identifier.
///
/// Rejects empty names, names containing NUL bytes and names longer than
/// PostgreSQL keeps.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Always double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an identifier only when PostgreSQL would require it.
///
/// Mirrors the server's `quote_ident()`: lower-case names made of letters,
/// digits and underscores that are not reserved words stay bare.
pub fn quote_ident_min(name: &str) -> String {
    let mut chars = name.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$'),
        _ => false,
    };
    if plain && !RESERVED.contains(&name) {
        name.to_string()
    } else {
        quote_ident(name)
    }
}

/// `schema.name`, each part quoted only if needed.
pub fn qualify(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident_min(schema), quote_ident_min(name))
}

/// `schema."name"`, the form used for table DDL.
pub fn qualify_table(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident_min(schema), quote_ident(name))
}

/// Quote a string literal, doubling single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Join names as a quoted, comma-separated column list.
pub fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a\0b").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
        assert!(validate_identifier(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_quote_ident_min() {
        assert_eq!(quote_ident_min("order_items"), "order_items");
        assert_eq!(quote_ident_min("_tmp1"), "_tmp1");
        assert_eq!(quote_ident_min("Orders"), "\"Orders\"");
        assert_eq!(quote_ident_min("user"), "\"user\"");
        assert_eq!(quote_ident_min("1abc"), "\"1abc\"");
        assert_eq!(quote_ident_min("with space"), "\"with space\"");
    }

    #[test]
    fn test_qualify_forms() {
        assert_eq!(qualify("public", "orders"), "public.orders");
        assert_eq!(qualify("public", "Orders"), "public.\"Orders\"");
        assert_eq!(qualify_table("public", "orders"), "public.\"orders\"");
    }

    #[test]
    fn test_quote_literal_and_list() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(
            quote_list(&["a".to_string(), "b".to_string()]),
            "\"a\", \"b\""
        );
    }
}
