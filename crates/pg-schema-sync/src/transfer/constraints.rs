//! Foreign key neutralization and restore on the target.
//!
//! Statements run in batches, each batch one transaction under
//! `SET LOCAL lock_timeout`. A failed batch is retried one statement per
//! transaction; statements that still fail are logged and skipped.

use serde::Serialize;
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::core::identifier::{qualify_table, quote_ident};
use crate::core::StatementRunner;
use crate::error::Result;

/// Every foreign key in a schema, with its definition text.
const TARGET_FOREIGN_KEYS_QUERY: &str = r#"
SELECT cl.relname::text AS table_name,
       c.conname::text AS constraint_name,
       pg_get_constraintdef(c.oid) AS definition
FROM pg_constraint c
JOIN pg_class cl ON cl.oid = c.conrelid
JOIN pg_namespace n ON n.oid = cl.relnamespace
WHERE c.contype = 'f'
  AND n.nspname = $1
ORDER BY cl.relname, c.conname
"#;

/// A foreign key recorded before it was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedForeignKey {
    pub table: String,
    pub name: String,
    /// `pg_get_constraintdef` text.
    pub definition: String,
}

impl RecordedForeignKey {
    pub fn label(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }

    pub fn drop_sql(&self, schema: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
            qualify_table(schema, &self.table),
            quote_ident(&self.name)
        )
    }

    /// Re-add without checking existing rows.
    pub fn restore_sql(&self, schema: &str) -> String {
        let definition = self.definition.trim_end();
        let definition = definition
            .strip_suffix("NOT VALID")
            .map(str::trim_end)
            .unwrap_or(definition);
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {} NOT VALID;",
            qualify_table(schema, &self.table),
            quote_ident(&self.name),
            definition
        )
    }

    pub fn validate_sql(&self, schema: &str) -> String {
        format!(
            "ALTER TABLE {} VALIDATE CONSTRAINT {};",
            qualify_table(schema, &self.table),
            quote_ident(&self.name)
        )
    }
}

/// Read every foreign key in `schema` on the target.
pub async fn record_foreign_keys(client: &Client, schema: &str) -> Result<Vec<RecordedForeignKey>> {
    let rows = client.query(TARGET_FOREIGN_KEYS_QUERY, &[&schema]).await?;
    Ok(rows
        .iter()
        .map(|r| RecordedForeignKey {
            table: r.get(0),
            name: r.get(1),
            definition: r.get(2),
        })
        .collect())
}

/// A statement that failed on its own after its batch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintFailure {
    pub constraint: String,
    pub message: String,
}

/// What a batched run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub applied: Vec<String>,
    pub failed: Vec<ConstraintFailure>,
}

/// Batch size and lock timeout for constraint DDL.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintBatcher {
    pub batch_size: usize,
    pub lock_timeout_ms: u64,
}

impl ConstraintBatcher {
    /// Run labelled statements in batches with per-statement fallback.
    pub async fn run<R>(&self, runner: &mut R, items: &[(String, String)]) -> BatchOutcome
    where
        R: StatementRunner + ?Sized,
    {
        let mut outcome = BatchOutcome::default();

        for chunk in items.chunks(self.batch_size.max(1)) {
            let statements: Vec<String> = chunk.iter().map(|(_, sql)| sql.clone()).collect();
            match runner
                .run_transaction(&statements, Some(self.lock_timeout_ms))
                .await
            {
                Ok(()) => outcome.applied.extend(chunk.iter().map(|(label, _)| label.clone())),
                Err(failure) => {
                    warn!(
                        "Constraint batch of {} failed ({}); retrying one at a time",
                        chunk.len(),
                        failure.message
                    );
                    for (label, sql) in chunk {
                        match runner
                            .run_transaction(std::slice::from_ref(sql), Some(self.lock_timeout_ms))
                            .await
                        {
                            Ok(()) => outcome.applied.push(label.clone()),
                            Err(f) => {
                                warn!(constraint = %label, "Skipping {}: {}", label, f.message);
                                outcome.failed.push(ConstraintFailure {
                                    constraint: label.clone(),
                                    message: f.message,
                                });
                            }
                        }
                    }
                }
            }
        }

        outcome
    }

    /// Drop every recorded foreign key.
    pub async fn drop_all<R>(&self, runner: &mut R, schema: &str, fks: &[RecordedForeignKey]) -> BatchOutcome
    where
        R: StatementRunner + ?Sized,
    {
        let items: Vec<(String, String)> = fks.iter().map(|fk| (fk.label(), fk.drop_sql(schema))).collect();
        let outcome = self.run(runner, &items).await;
        info!(
            "Dropped {} of {} foreign keys on target",
            outcome.applied.len(),
            fks.len()
        );
        outcome
    }

    /// Re-add every recorded foreign key as `NOT VALID`.
    pub async fn restore_all<R>(
        &self,
        runner: &mut R,
        schema: &str,
        fks: &[RecordedForeignKey],
    ) -> BatchOutcome
    where
        R: StatementRunner + ?Sized,
    {
        let items: Vec<(String, String)> = fks
            .iter()
            .map(|fk| (fk.label(), fk.restore_sql(schema)))
            .collect();
        let outcome = self.run(runner, &items).await;
        info!(
            "Restored {} of {} foreign keys as NOT VALID",
            outcome.applied.len(),
            fks.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StatementFailure;
    use async_trait::async_trait;

    fn fk(table: &str, name: &str) -> RecordedForeignKey {
        RecordedForeignKey {
            table: table.into(),
            name: name.into(),
            definition: format!("FOREIGN KEY (ref_id) REFERENCES {}(id)", table),
        }
    }

    // =========================================================================
    // Statement text
    // =========================================================================

    #[test]
    fn test_restore_is_not_valid() {
        let f = fk("orders", "orders_user_fk");
        assert_eq!(
            f.restore_sql("public"),
            "ALTER TABLE public.\"orders\" ADD CONSTRAINT \"orders_user_fk\" FOREIGN KEY (ref_id) REFERENCES orders(id) NOT VALID;"
        );
        let mut already = f.clone();
        already.definition.push_str(" NOT VALID");
        assert_eq!(already.restore_sql("public"), f.restore_sql("public"));
    }

    #[test]
    fn test_drop_and_validate_text() {
        let f = fk("orders", "orders_user_fk");
        assert_eq!(
            f.drop_sql("public"),
            "ALTER TABLE public.\"orders\" DROP CONSTRAINT IF EXISTS \"orders_user_fk\";"
        );
        assert_eq!(
            f.validate_sql("public"),
            "ALTER TABLE public.\"orders\" VALIDATE CONSTRAINT \"orders_user_fk\";"
        );
    }

    // =========================================================================
    // Batching
    // =========================================================================

    /// Fails any transaction containing a statement that mentions `locked`.
    #[derive(Default)]
    struct LockingRunner {
        locked: Vec<&'static str>,
        transactions: Vec<usize>,
        timeouts: Vec<Option<u64>>,
    }

    #[async_trait]
    impl StatementRunner for LockingRunner {
        async fn run_transaction(
            &mut self,
            statements: &[String],
            lock_timeout_ms: Option<u64>,
        ) -> std::result::Result<(), StatementFailure> {
            self.transactions.push(statements.len());
            self.timeouts.push(lock_timeout_ms);
            for (i, s) in statements.iter().enumerate() {
                if self.locked.iter().any(|l| s.contains(l)) {
                    return Err(StatementFailure::new(i, s.clone(), "canceling statement due to lock timeout"));
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batches_succeed_whole() {
        let mut runner = LockingRunner::default();
        let batcher = ConstraintBatcher { batch_size: 2, lock_timeout_ms: 5000 };
        let fks: Vec<_> = (0..5).map(|i| fk("t", &format!("fk{}", i))).collect();
        let out = batcher.drop_all(&mut runner, "public", &fks).await;
        assert_eq!(out.applied.len(), 5);
        assert!(out.failed.is_empty());
        assert_eq!(runner.transactions, vec![2, 2, 1]);
        assert!(runner.timeouts.iter().all(|t| *t == Some(5000)));
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_per_statement() {
        let mut runner = LockingRunner {
            locked: vec!["\"fk1\""],
            ..Default::default()
        };
        let batcher = ConstraintBatcher { batch_size: 3, lock_timeout_ms: 100 };
        let fks: Vec<_> = (0..4).map(|i| fk("t", &format!("fk{}", i))).collect();
        let out = batcher.restore_all(&mut runner, "public", &fks).await;

        // batch [0,1,2] fails, retried 3 singles; batch [3] succeeds
        assert_eq!(runner.transactions, vec![3, 1, 1, 1, 1]);
        assert_eq!(out.applied, vec!["t.fk0", "t.fk2", "t.fk3"]);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].constraint, "t.fk1");
        assert!(out.failed[0].message.contains("lock timeout"));
    }
}
