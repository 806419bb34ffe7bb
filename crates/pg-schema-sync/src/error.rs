//! Error types for the sync library.

use thiserror::Error;

/// Main error type for schema sync and data migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, unknown target, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query error
    #[error("Database error: {}", crate::core::pg_error_message(.0))]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Catalog introspection failed
    #[error("Introspection failed: {0}")]
    Introspection(String),

    /// A plan block failed while being applied to the target.
    ///
    /// Blocks before it stay committed.
    #[error("Block {block} failed ({applied} of {total} blocks applied): {message}\n  Statement: {statement}")]
    Execution {
        block: String,
        statement: String,
        message: String,
        applied: usize,
        total: usize,
    },

    /// Data load failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Some tables exhausted their retry budget
    #[error("Data migration incomplete: {} table(s) permanently failed: {}", failed.len(), failed.join(", "))]
    PartialDataMigration { failed: Vec<String> },

    /// Post-load validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// IO error (history files, config file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Process exit code for this error.
    ///
    /// A partial data migration means the schema phase succeeded, so it is
    /// distinguished from fatal errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::PartialDataMigration { .. } => 2,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("missing".into()).exit_code(), 1);
        assert_eq!(MigrateError::pool("refused", "connecting").exit_code(), 1);
        let partial = MigrateError::PartialDataMigration {
            failed: vec!["orders".into(), "users".into()],
        };
        assert_eq!(partial.exit_code(), 2);
    }

    #[test]
    fn test_partial_message_lists_tables() {
        let partial = MigrateError::PartialDataMigration {
            failed: vec!["orders".into(), "users".into()],
        };
        let msg = partial.to_string();
        assert!(msg.contains("2 table(s)"));
        assert!(msg.contains("orders, users"));
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml");
        let err = MigrateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
    }

    #[test]
    fn test_database_error_shows_underlying_text() {
        let pg = "port=notanumber".parse::<tokio_postgres::Config>().unwrap_err();
        let err = MigrateError::from(pg);
        assert_eq!(
            err.to_string(),
            "Database error: invalid connection string: invalid value for option `port`"
        );
        // Wrapping keeps the text that retry bookkeeping stores.
        let wrapped = MigrateError::transfer("orders", err);
        assert!(wrapped.to_string().contains("invalid value for option `port`"));
    }
}
