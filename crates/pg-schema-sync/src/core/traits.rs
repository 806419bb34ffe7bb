//! Seams between the engines and the database.
//!
//! - [`StatementRunner`]: runs a list of statements as one transaction. The
//!   plan executor, the constraint batcher and FK validation use it.
//! - [`TableLoader`]: copies one table; driven by the retry engine.
//!
//! Both are implemented for the real PostgreSQL client types and mocked in
//! tests.

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::error::Result;

/// A statement that failed inside a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFailure {
    /// Position of the failing statement in the batch.
    pub index: usize,
    pub statement: String,
    pub message: String,
}

impl StatementFailure {
    pub fn new(index: usize, statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            statement: statement.into(),
            message: message.into(),
        }
    }
}

/// Run SQL against one connection.
#[async_trait]
pub trait StatementRunner: Send {
    /// Run `statements` in a single transaction.
    ///
    /// Commits when all of them succeed; rolls back and reports the first
    /// failure otherwise. `lock_timeout_ms` is applied with `SET LOCAL`.
    async fn run_transaction(
        &mut self,
        statements: &[String],
        lock_timeout_ms: Option<u64>,
    ) -> std::result::Result<(), StatementFailure>;
}

#[async_trait]
impl StatementRunner for Client {
    async fn run_transaction(
        &mut self,
        statements: &[String],
        lock_timeout_ms: Option<u64>,
    ) -> std::result::Result<(), StatementFailure> {
        let tx = self
            .transaction()
            .await
            .map_err(|e| StatementFailure::new(0, "BEGIN", pg_error_message(&e)))?;

        if let Some(ms) = lock_timeout_ms {
            let set = format!("SET LOCAL lock_timeout = '{}ms'", ms);
            if let Err(e) = tx.batch_execute(&set).await {
                let failure = StatementFailure::new(0, set, pg_error_message(&e));
                let _ = tx.rollback().await;
                return Err(failure);
            }
        }

        for (index, statement) in statements.iter().enumerate() {
            if let Err(e) = tx.batch_execute(statement).await {
                let failure = StatementFailure::new(index, statement.as_str(), pg_error_message(&e));
                let _ = tx.rollback().await;
                return Err(failure);
            }
        }

        tx.commit()
            .await
            .map_err(|e| StatementFailure::new(statements.len(), "COMMIT", pg_error_message(&e)))
    }
}

/// Load a single table from source to target.
#[async_trait]
pub trait TableLoader: Send + Sync {
    /// Copy all rows of `table`, returning the number of rows written.
    async fn load_table(&self, table: &str) -> Result<u64>;
}

/// Server message with detail and hint when available, the client error
/// text followed by its causes otherwise.
pub fn pg_error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => {
            let mut msg = format!("{}: {}", db.severity(), db.message());
            if let Some(detail) = db.detail() {
                msg.push_str(&format!(" ({})", detail));
            }
            if let Some(hint) = db.hint() {
                msg.push_str(&format!(" [hint: {}]", hint));
            }
            msg
        }
        None => {
            let mut msg = e.to_string();
            let mut source = std::error::Error::source(e);
            while let Some(cause) = source {
                msg.push_str(&format!(": {}", cause));
                source = cause.source();
            }
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_failure_new() {
        let f = StatementFailure::new(2, "ALTER TABLE x", "lock timeout");
        assert_eq!(f.index, 2);
        assert_eq!(f.statement, "ALTER TABLE x");
        assert_eq!(f.message, "lock timeout");
    }

    #[test]
    fn test_client_error_message_includes_cause() {
        let e = "host=localhost port=notanumber"
            .parse::<tokio_postgres::Config>()
            .unwrap_err();
        assert_eq!(
            pg_error_message(&e),
            "invalid connection string: invalid value for option `port`"
        );
    }
}
