//! Applies a migration plan to the target.
//!
//! Each [`SqlBlock`] is split into statements and run in its own transaction.
//! A failing block is rolled back and stops execution; blocks committed
//! before it stay applied.

use serde::Serialize;
use tracing::{error, info};

use crate::core::StatementRunner;
use crate::diff::SqlBlock;
use crate::error::{MigrateError, Result};

/// The block that stopped execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockFailure {
    /// `CATEGORY name`
    pub block: String,
    pub statement: String,
    pub message: String,
}

/// Outcome of applying a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub blocks_total: usize,
    pub blocks_applied: usize,
    pub failure: Option<BlockFailure>,
}

impl ExecutionReport {
    /// `Err(Execution)` if a block failed.
    pub fn into_result(self) -> Result<Self> {
        match self.failure {
            Some(f) => Err(MigrateError::Execution {
                block: f.block,
                statement: f.statement,
                message: f.message,
                applied: self.blocks_applied,
                total: self.blocks_total,
            }),
            None => Ok(self),
        }
    }
}

/// Apply `blocks` in order, one transaction per block.
pub async fn apply_blocks<R>(runner: &mut R, blocks: &[SqlBlock]) -> ExecutionReport
where
    R: StatementRunner + ?Sized,
{
    let mut report = ExecutionReport {
        blocks_total: blocks.len(),
        ..Default::default()
    };

    for (i, block) in blocks.iter().enumerate() {
        let label = format!("{} {}", block.category, block.name);
        let statements = split_statements(&block.sql);
        if statements.is_empty() {
            report.blocks_applied += 1;
            continue;
        }

        match runner.run_transaction(&statements, None).await {
            Ok(()) => {
                report.blocks_applied += 1;
                info!("Applied [{}/{}] {}", i + 1, blocks.len(), label);
            }
            Err(failure) => {
                error!("Block {} failed, rolled back: {}", label, failure.message);
                report.failure = Some(BlockFailure {
                    block: label,
                    statement: failure.statement,
                    message: failure.message,
                });
                break;
            }
        }
    }

    report
}

/// Split SQL text into statements on `;`.
///
/// Semicolons inside string literals, quoted identifiers, dollar-quoted
/// bodies and comments do not split. Comments are dropped; empty statements
/// are skipped. Each returned statement keeps its terminating `;`.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    let mut flush = |current: &mut String, terminated: bool| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            let mut stmt = trimmed.to_string();
            if terminated {
                stmt.push(';');
            }
            statements.push(stmt);
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut depth = 0;
                while i < chars.len() {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
                current.push(' ');
                continue;
            }
            '\'' | '"' => {
                current.push(c);
                i += 1;
                while i < chars.len() {
                    current.push(chars[i]);
                    if chars[i] == c {
                        break;
                    }
                    i += 1;
                }
                i += 1;
                continue;
            }
            '$' => {
                if let Some(end) = crate::diff::normalize::dollar_quoted_end(&chars, i) {
                    current.extend(&chars[i..end]);
                    i = end;
                    continue;
                }
                current.push(c);
            }
            ';' => flush(&mut current, true),
            _ => current.push(c),
        }
        i += 1;
    }
    flush(&mut current, false);

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StatementFailure;
    use crate::diff::ObjectCategory;
    use async_trait::async_trait;

    // =========================================================================
    // Statement splitting
    // =========================================================================

    #[test]
    fn test_split_simple() {
        let stmts = split_statements("DROP TABLE a;\nCREATE TABLE a (id int);");
        assert_eq!(stmts, vec!["DROP TABLE a;", "CREATE TABLE a (id int);"]);
    }

    #[test]
    fn test_split_drops_comments_and_blanks() {
        let sql = "-- CREATE TABLE x\n-- a; b\nCREATE TABLE x (id int); /* c; d */ ;\n";
        assert_eq!(split_statements(sql), vec!["CREATE TABLE x (id int);"]);
    }

    #[test]
    fn test_split_respects_quotes() {
        let sql = "INSERT INTO t VALUES ('a;b', 'it''s');SELECT \"odd;name\" FROM t;";
        assert_eq!(
            split_statements(sql),
            vec![
                "INSERT INTO t VALUES ('a;b', 'it''s');",
                "SELECT \"odd;name\" FROM t;"
            ]
        );
    }

    #[test]
    fn test_split_respects_dollar_quotes() {
        let sql = "CREATE FUNCTION f() RETURNS int LANGUAGE plpgsql AS $fn$ BEGIN RETURN 1; END; $fn$;\n\
                   DO $$ BEGIN PERFORM 1; END $$;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("$fn$;"));
        assert!(stmts[0].contains("RETURN 1; END;"));
        assert_eq!(stmts[1], "DO $$ BEGIN PERFORM 1; END $$;");
    }

    #[test]
    fn test_split_positional_param_is_not_a_tag() {
        let stmts = split_statements("SELECT $1; SELECT 2;");
        assert_eq!(stmts, vec!["SELECT $1;", "SELECT 2;"]);
    }

    #[test]
    fn test_split_unterminated_tail() {
        assert_eq!(split_statements("SELECT 1"), vec!["SELECT 1"]);
        assert!(split_statements("  -- only a comment\n").is_empty());
    }

    // =========================================================================
    // Block execution
    // =========================================================================

    #[derive(Default)]
    struct RecordingRunner {
        committed: Vec<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl StatementRunner for RecordingRunner {
        async fn run_transaction(
            &mut self,
            statements: &[String],
            _lock_timeout_ms: Option<u64>,
        ) -> std::result::Result<(), StatementFailure> {
            if let Some(pattern) = self.fail_on {
                if let Some((i, s)) = statements.iter().enumerate().find(|(_, s)| s.contains(pattern)) {
                    return Err(StatementFailure::new(i, s.clone(), "relation does not exist"));
                }
            }
            self.committed.push(statements.to_vec());
            Ok(())
        }
    }

    fn block(name: &str, sql: &str) -> SqlBlock {
        SqlBlock {
            category: ObjectCategory::Table,
            name: name.into(),
            sql: sql.into(),
        }
    }

    #[tokio::test]
    async fn test_apply_all_blocks() {
        let mut runner = RecordingRunner::default();
        let blocks = vec![
            block("a", "-- CREATE TABLE a\nCREATE TABLE a (id int);"),
            block("b", "-- TABLE b differs. Recreating.\nDROP TABLE IF EXISTS b CASCADE;\nCREATE TABLE b (id int);"),
        ];
        let report = apply_blocks(&mut runner, &blocks).await;
        assert_eq!(report.blocks_applied, 2);
        assert!(report.failure.is_none());
        assert_eq!(runner.committed[1].len(), 2);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_failure_stops_and_keeps_prior_blocks() {
        let mut runner = RecordingRunner {
            fail_on: Some("CREATE TABLE b"),
            ..Default::default()
        };
        let blocks = vec![
            block("a", "CREATE TABLE a (id int);"),
            block("b", "DROP TABLE IF EXISTS b;\nCREATE TABLE b (id int);"),
            block("c", "CREATE TABLE c (id int);"),
        ];
        let report = apply_blocks(&mut runner, &blocks).await;
        assert_eq!(report.blocks_total, 3);
        assert_eq!(report.blocks_applied, 1);
        assert_eq!(runner.committed.len(), 1);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.block, "TABLE b");
        assert_eq!(failure.statement, "CREATE TABLE b (id int);");

        let err = report.into_result().unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Block TABLE b failed (1 of 3 blocks applied): "));
        match err {
            MigrateError::Execution { block, applied, total, .. } => {
                assert_eq!(block, "TABLE b");
                assert_eq!((applied, total), (1, 3));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
    }
}
