//! Live integrity checks against the databases.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::core::identifier::qualify_table;
use crate::core::StatementRunner;
use crate::error::{MigrateError, Result};

const UNVALIDATED_CONSTRAINTS_QUERY: &str = r#"
SELECT cl.relname::text AS table_name,
       c.conname::text AS constraint_name,
       CASE c.contype
           WHEN 'f' THEN 'FOREIGN KEY'
           WHEN 'c' THEN 'CHECK'
           ELSE c.contype::text
       END AS constraint_type
FROM pg_constraint c
JOIN pg_class cl ON cl.oid = c.conrelid
JOIN pg_namespace n ON n.oid = cl.relnamespace
WHERE NOT c.convalidated
  AND n.nspname = $1
ORDER BY cl.relname, c.conname
"#;

/// A constraint added as `NOT VALID` and not yet validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnvalidatedConstraint {
    pub table: String,
    pub constraint: String,
    pub constraint_type: String,
}

pub async fn unvalidated_constraints(client: &Client, schema: &str) -> Result<Vec<UnvalidatedConstraint>> {
    let rows = client.query(UNVALIDATED_CONSTRAINTS_QUERY, &[&schema]).await?;
    Ok(rows
        .iter()
        .map(|r| UnvalidatedConstraint {
            table: r.get(0),
            constraint: r.get(1),
            constraint_type: r.get(2),
        })
        .collect())
}

/// `COUNT(*)` of each table.
pub async fn count_rows<'a>(
    client: &Client,
    schema: &str,
    tables: impl IntoIterator<Item = &'a String>,
) -> Result<BTreeMap<String, i64>> {
    let mut counts = BTreeMap::new();
    for table in tables {
        let row = client
            .query_one(
                &format!("SELECT COUNT(*) FROM {}", qualify_table(schema, table)),
                &[],
            )
            .await?;
        counts.insert(table.clone(), row.get::<_, i64>(0));
    }
    Ok(counts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowCountMismatch {
    pub table: String,
    pub source: i64,
    pub target: i64,
}

/// Result of comparing row counts of the tables common to both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowCountCheck {
    pub tables_checked: usize,
    pub mismatches: Vec<RowCountMismatch>,
}

impl RowCountCheck {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compare counts for tables present in both maps.
pub fn compare_counts(source: &BTreeMap<String, i64>, target: &BTreeMap<String, i64>) -> RowCountCheck {
    let mut check = RowCountCheck::default();
    for (table, &src) in source {
        let Some(&tgt) = target.get(table) else {
            continue;
        };
        check.tables_checked += 1;
        if src != tgt {
            check.mismatches.push(RowCountMismatch {
                table: table.clone(),
                source: src,
                target: tgt,
            });
        }
    }
    check
}

/// Count `tables` on both sides and report mismatches. Never repairs.
pub async fn check_row_counts(
    source: &Client,
    target: &Client,
    schema: &str,
    tables: &[String],
) -> Result<RowCountCheck> {
    let source_counts = count_rows(source, schema, tables).await?;
    let target_counts = count_rows(target, schema, tables).await?;
    let check = compare_counts(&source_counts, &target_counts);
    for m in &check.mismatches {
        warn!(
            table = %m.table,
            "{}: source={} target={} (MISMATCH)",
            m.table, m.source, m.target
        );
    }
    info!(
        "Row counts checked for {} tables, {} mismatched",
        check.tables_checked,
        check.mismatches.len()
    );
    Ok(check)
}

/// Executable lines of a validate file: blank and `--` lines are skipped.
pub fn parse_validate_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("--"))
        .map(String::from)
        .collect()
}

/// Run validate statements in one transaction.
pub async fn run_validate_statements<R>(runner: &mut R, statements: &[String]) -> Result<usize>
where
    R: StatementRunner + ?Sized,
{
    if statements.is_empty() {
        return Ok(0);
    }
    runner
        .run_transaction(statements, None)
        .await
        .map_err(|f| MigrateError::Execution {
            block: "VALIDATE CONSTRAINTS".to_string(),
            statement: f.statement,
            message: f.message,
            applied: 0,
            total: 1,
        })?;
    info!("Validated {} constraints", statements.len());
    Ok(statements.len())
}
