//! Data migration engine.
//!
//! Loads every table from source to target in parallel. Ordering between
//! tables is irrelevant because all target foreign keys are dropped first
//! and re-added as `NOT VALID` afterwards:
//!
//! 1. build copy plans and check out (source, target) pairs from a [`PairPool`]
//! 2. record and drop target FKs on one designated connection
//! 3. load tables concurrently with bounded retry rounds
//! 4. restore FKs `NOT VALID` and collect `VALIDATE CONSTRAINT` statements
//! 5. reconcile sequences
//! 6. compare row counts
//!
//! Per-table failures never abort the run; they are reported.

pub mod constraints;
pub mod encode;
pub mod pool;
pub mod retry;
pub mod sequences;

pub use constraints::{BatchOutcome, ConstraintBatcher, ConstraintFailure, RecordedForeignKey};
pub use encode::{copy_table, ColumnKind, TableCopyPlan};
pub use pool::{ConnectionPair, PairGuard, PairPool};
pub use retry::{run_with_retries, RetryOutcome, RetryPolicy, TableState};
pub use sequences::{SequenceAdjustment, SequenceReport};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde::Serialize;
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::config::DataConfig;
use crate::core::{SchemaSnapshot, StatementRunner, Table, TableLoader};
use crate::error::{MigrateError, Result};
use crate::verify::{check_row_counts, RowCountCheck};

/// Outcome of a data migration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataMigrationReport {
    /// Rows written per loaded table.
    pub tables_loaded: BTreeMap<String, u64>,
    /// Last error per permanently failed table.
    pub failed_tables: BTreeMap<String, String>,
    /// Tables on the skip list.
    pub skipped_tables: Vec<String>,
    /// Source tables that do not exist on the target.
    pub missing_on_target: Vec<String>,
    pub load_rounds: u32,
    pub constraints_dropped: usize,
    pub constraints_restored: usize,
    pub constraint_failures: Vec<ConstraintFailure>,
    /// Deferred `VALIDATE CONSTRAINT` statements for restored FKs.
    pub validate_statements: Vec<String>,
    pub sequences: SequenceReport,
    pub row_counts: RowCountCheck,
    pub duration_seconds: f64,
}

impl DataMigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failed_tables.is_empty()
    }

    /// `Err(PartialDataMigration)` when any table permanently failed.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        Err(MigrateError::PartialDataMigration {
            failed: self.failed_tables.keys().cloned().collect(),
        })
    }

    fn absorb(&mut self, outcome: RetryOutcome) {
        self.tables_loaded.extend(outcome.loaded());
        self.failed_tables.extend(outcome.failed());
        self.load_rounds = outcome.rounds;
    }
}

/// Which source tables get loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSelection {
    pub load: Vec<String>,
    pub skipped: Vec<String>,
    pub missing: Vec<String>,
}

/// Source tables present on the target and not on the skip list.
pub fn select_tables(
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    skip: &[String],
) -> TableSelection {
    let skip: BTreeSet<&str> = skip.iter().map(String::as_str).collect();
    let mut selection = TableSelection::default();
    for name in source.tables.keys() {
        if skip.contains(name.as_str()) {
            selection.skipped.push(name.clone());
        } else if !target.tables.contains_key(name) {
            selection.missing.push(name.clone());
        } else {
            selection.load.push(name.clone());
        }
    }
    selection
}

/// Copy plans for every selected table. Tables whose plan cannot be built
/// are returned as failures.
fn build_plans(
    schema: &str,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    tables: &[String],
) -> (BTreeMap<String, TableCopyPlan>, BTreeMap<String, String>) {
    let mut plans = BTreeMap::new();
    let mut failed = BTreeMap::new();
    for name in tables {
        let (Some(src), Some(tgt)) = (source.tables.get(name), target.tables.get(name)) else {
            continue;
        };
        match TableCopyPlan::new(schema, src, tgt) {
            Ok(plan) => {
                plans.insert(name.clone(), plan);
            }
            Err(e) => {
                warn!(table = %name, "Not loading {}: {}", name, e);
                failed.insert(name.clone(), e.to_string());
            }
        }
    }
    (plans, failed)
}

/// Loads tables over pooled connection pairs.
struct PairLoader {
    pool: Arc<PairPool<Object, Object>>,
    plans: BTreeMap<String, TableCopyPlan>,
    batch_rows: usize,
}

#[async_trait]
impl TableLoader for PairLoader {
    async fn load_table(&self, table: &str) -> Result<u64> {
        let plan = self
            .plans
            .get(table)
            .ok_or_else(|| MigrateError::transfer(table, "no copy plan"))?;
        let mut guard = self.pool.checkout().await?;
        let pair = &mut *guard;
        let source: &Client = &pair.source;
        let target: &mut Client = &mut pair.target;

        copy_table(source, target, plan, self.batch_rows)
            .await
            .map_err(|e| match e {
                MigrateError::Transfer { .. } => e,
                other => MigrateError::transfer(table, other),
            })
    }
}

/// Constraint outcomes around one load.
#[derive(Debug, Default)]
struct NeutralizedLoad {
    dropped: BatchOutcome,
    outcome: Option<RetryOutcome>,
    restored: BatchOutcome,
}

/// Drop `fks`, load `tables`, then restore `fks`. Load failures are
/// recorded in the outcome; the restore always runs.
async fn load_with_foreign_keys_dropped<R, L>(
    batcher: ConstraintBatcher,
    runner: &mut R,
    schema: &str,
    fks: &[RecordedForeignKey],
    loader: Option<Arc<L>>,
    tables: Vec<String>,
    policy: RetryPolicy,
) -> NeutralizedLoad
where
    R: StatementRunner + ?Sized,
    L: TableLoader + 'static,
{
    let dropped = batcher.drop_all(runner, schema, fks).await;
    // The loader is consumed here so its connection pairs are released
    // before the restore.
    let outcome = match loader {
        Some(loader) => Some(run_with_retries(loader, tables, policy).await),
        None => None,
    };
    let restored = batcher.restore_all(runner, schema, fks).await;
    NeutralizedLoad {
        dropped,
        outcome,
        restored,
    }
}

/// Parallel data migration between two pools.
pub struct DataMigrationEngine {
    source: Pool,
    target: Pool,
    schema: String,
    settings: DataConfig,
}

impl DataMigrationEngine {
    /// `target` must allow `settings.workers + 1` connections: one per pair
    /// plus the designated constraint connection.
    pub fn new(source: Pool, target: Pool, schema: impl Into<String>, settings: DataConfig) -> Self {
        Self {
            source,
            target,
            schema: schema.into(),
            settings,
        }
    }

    fn batcher(&self) -> ConstraintBatcher {
        ConstraintBatcher {
            batch_size: self.settings.constraint_batch_size,
            lock_timeout_ms: self.settings.lock_timeout_ms,
        }
    }

    fn policy(&self, workers: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.settings.max_attempts,
            workers,
        }
    }

    async fn connection(pool: &Pool, context: &str) -> Result<Object> {
        pool.get().await.map_err(|e| MigrateError::pool(e, context))
    }

    /// Full run over every table of the source snapshot.
    ///
    /// Snapshots must describe the target after the schema phase.
    pub async fn run(&self, source: &SchemaSnapshot, target: &SchemaSnapshot) -> Result<DataMigrationReport> {
        let started = Instant::now();
        let schema = self.schema.as_str();
        let selection = select_tables(source, target, &self.settings.skip_tables);
        let mut report = DataMigrationReport {
            skipped_tables: selection.skipped.clone(),
            missing_on_target: selection.missing.clone(),
            ..Default::default()
        };
        for t in &selection.missing {
            warn!(table = %t, "Table {} does not exist on target; not loaded", t);
        }
        info!(
            "Loading {} tables ({} skipped) with {} workers",
            selection.load.len(),
            selection.skipped.len(),
            self.settings.workers
        );

        // Everything fallible runs before the foreign keys are dropped.
        let (plans, unplannable) = build_plans(schema, source, target, &selection.load);
        report.failed_tables.extend(unplannable);
        let tables: Vec<String> = plans.keys().cloned().collect();
        let workers = self.settings.workers.min(tables.len()).max(1);
        let loader = if tables.is_empty() {
            None
        } else {
            let pool = PairPool::from_pools(&self.source, &self.target, workers).await?;
            Some(Arc::new(PairLoader {
                pool,
                plans,
                batch_rows: self.settings.insert_batch_rows,
            }))
        };

        // The designated connection owns all constraint DDL.
        let mut designated = Self::connection(&self.target, "designated constraint connection").await?;
        let designated: &mut Client = &mut designated;
        let fks = constraints::record_foreign_keys(designated, schema).await?;

        let load = load_with_foreign_keys_dropped(
            self.batcher(),
            designated,
            schema,
            &fks,
            loader,
            tables,
            self.policy(workers),
        )
        .await;
        report.constraints_dropped = load.dropped.applied.len();
        report.constraint_failures.extend(load.dropped.failed);
        if let Some(outcome) = load.outcome {
            report.absorb(outcome);
        }
        let restored = load.restored;
        report.constraints_restored = restored.applied.len();
        report.constraint_failures.extend(restored.failed);
        let restored: BTreeSet<&String> = restored.applied.iter().collect();
        report.validate_statements = fks
            .iter()
            .filter(|fk| restored.contains(&fk.label()))
            .map(|fk| fk.validate_sql(schema))
            .collect();

        let source_conn = Self::connection(&self.source, "sequence reconciliation").await?;
        let loaded: Vec<&Table> = report
            .tables_loaded
            .keys()
            .filter_map(|t| target.tables.get(t))
            .collect();
        report.sequences = sequences::reconcile_identity_sequences(designated, schema, &loaded).await;
        report.sequences.merge(
            sequences::copy_sequences(&source_conn, designated, schema, source.sequences.values()).await,
        );

        let common: Vec<String> = source
            .tables
            .keys()
            .filter(|t| target.tables.contains_key(*t))
            .cloned()
            .collect();
        report.row_counts = check_row_counts(&source_conn, designated, schema, &common).await?;

        report.duration_seconds = started.elapsed().as_secs_f64();
        self.log_summary(&report);
        Ok(report)
    }

    /// Load a single table without touching constraints.
    pub async fn migrate_table(
        &self,
        table: &str,
        source: &SchemaSnapshot,
        target: &SchemaSnapshot,
    ) -> Result<DataMigrationReport> {
        let started = Instant::now();
        let schema = self.schema.as_str();
        if !source.tables.contains_key(table) {
            return Err(MigrateError::Config(format!("table {} not found on source", table)));
        }
        if !target.tables.contains_key(table) {
            return Err(MigrateError::Config(format!("table {} not found on target", table)));
        }

        let mut report = DataMigrationReport::default();
        let names = vec![table.to_string()];
        let (plans, unplannable) = build_plans(schema, source, target, &names);
        report.failed_tables.extend(unplannable);

        if !plans.is_empty() {
            let pool = PairPool::from_pools(&self.source, &self.target, 1).await?;
            let loader = Arc::new(PairLoader {
                pool,
                plans,
                batch_rows: self.settings.insert_batch_rows,
            });
            let outcome = run_with_retries(Arc::clone(&loader), names.clone(), self.policy(1)).await;
            drop(loader);
            report.absorb(outcome);
        }

        let source_conn = Self::connection(&self.source, "row count").await?;
        let target_conn = Self::connection(&self.target, "sequence reconciliation").await?;
        if report.tables_loaded.contains_key(table) {
            let loaded: Vec<&Table> = target.tables.get(table).into_iter().collect();
            report.sequences = sequences::reconcile_identity_sequences(&target_conn, schema, &loaded).await;
        }
        report.row_counts = check_row_counts(&source_conn, &target_conn, schema, &names).await?;

        report.duration_seconds = started.elapsed().as_secs_f64();
        self.log_summary(&report);
        Ok(report)
    }

    fn log_summary(&self, report: &DataMigrationReport) {
        let rows: u64 = report.tables_loaded.values().sum();
        info!(
            "Data migration finished in {:.1}s: {} tables loaded ({} rows), {} failed, {} sequences adjusted, {} row count mismatches",
            report.duration_seconds,
            report.tables_loaded.len(),
            rows,
            report.failed_tables.len(),
            report.sequences.adjustments.len(),
            report.row_counts.mismatches.len()
        );
        for (table, error) in &report.failed_tables {
            warn!(table = %table, "Permanently failed: {}", error);
        }
        if !report.constraint_failures.is_empty() {
            warn!(
                "{} constraint statements failed; see report",
                report.constraint_failures.len()
            );
        }
    }
}
