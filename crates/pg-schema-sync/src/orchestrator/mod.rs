//! End-to-end flows: schema sync, data migration and follow-up checks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use serde::Serialize;
use tokio_postgres::Client;
use tracing::{error, info, warn};

use crate::artifacts::{latest_validate_file, HistoryWriter};
use crate::config::Config;
use crate::connect::{connect_pool, ping};
use crate::core::SchemaSnapshot;
use crate::diff::{generate_plan, DiffOptions, FkMode};
use crate::error::{MigrateError, Result};
use crate::executor::apply_blocks;
use crate::introspect::Introspector;
use crate::transfer::{DataMigrationEngine, DataMigrationReport};
use crate::verify::{
    check_row_counts, parse_validate_file, run_validate_statements, unvalidated_constraints,
    verify_snapshots, RowCountCheck, UnvalidatedConstraint, VerifyReport,
};

/// Pretty JSON output for result types.
pub trait JsonReport: Serialize {
    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Switches for the schema sync flow.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Report differences only; generate no SQL.
    pub verify_only: bool,
    /// Apply the generated plan to the target.
    pub commit: bool,
    pub use_alter: bool,
    /// Run the data migration after the schema phase.
    pub with_data: bool,
    pub fk_mode: FkMode,
    pub install_extensions: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            verify_only: false,
            commit: true,
            use_alter: false,
            with_data: false,
            fk_mode: FkMode::Add,
            install_extensions: false,
        }
    }
}

/// Result of the schema sync flow.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub target: String,
    /// verified, up_to_date, generated, applied, partial
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyReport>,
    /// Blocks per category label.
    pub summary: BTreeMap<String, usize>,
    pub blocks_total: usize,
    pub blocks_applied: usize,
    pub skipped_objects: usize,
    pub recreated_tables: Vec<String>,
    pub warnings: Vec<String>,
    pub migration_file: Option<PathBuf>,
    pub skip_file: Option<PathBuf>,
    pub validate_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataMigrationReport>,
}

impl SyncResult {
    fn new(target: &str, status: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            target: target.to_string(),
            status: status.to_string(),
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            verify: None,
            summary: BTreeMap::new(),
            blocks_total: 0,
            blocks_applied: 0,
            skipped_objects: 0,
            recreated_tables: Vec::new(),
            warnings: Vec::new(),
            migration_file: None,
            skip_file: None,
            validate_file: None,
            data: None,
        }
    }

    fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self.duration_seconds =
            (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        self
    }

    /// `Err(PartialDataMigration)` when the data phase left failed tables.
    pub fn ensure_complete(&self) -> Result<()> {
        match &self.data {
            Some(report) => report.ensure_complete(),
            None => Ok(()),
        }
    }
}

impl JsonReport for SyncResult {}

/// Result of `migrate-data` and `migrate-table`.
#[derive(Debug, Clone, Serialize)]
pub struct DataResult {
    pub target: String,
    pub status: String,
    pub validate_file: Option<PathBuf>,
    pub report: DataMigrationReport,
}

impl DataResult {
    pub fn ensure_complete(&self) -> Result<()> {
        self.report.ensure_complete()
    }
}

impl JsonReport for DataResult {}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateResult {
    pub target: String,
    pub file: Option<PathBuf>,
    pub statements_executed: usize,
}

impl JsonReport for ValidateResult {}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSchemaResult {
    pub target: String,
    pub unvalidated: Vec<UnvalidatedConstraint>,
}

impl JsonReport for CheckSchemaResult {}

#[derive(Debug, Clone, Serialize)]
pub struct CheckDataResult {
    pub target: String,
    pub check: RowCountCheck,
}

impl JsonReport for CheckDataResult {}

/// Connectivity of one database.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source: EndpointHealth,
    pub target: EndpointHealth,
}

impl JsonReport for HealthCheckResult {}

/// Runs flows against the source and one target.
pub struct Orchestrator {
    config: Config,
    target_name: String,
    source: Pool,
    target: Pool,
    introspector: Introspector,
}

impl Orchestrator {
    /// Pick the target and open both pools.
    pub async fn new(config: Config, target: Option<&str>) -> Result<Self> {
        let (target_name, target_conn) = config.target(target)?;
        let target_name = target_name.to_string();
        // One connection per worker pair plus the designated and spare ones.
        let size = config.data.workers + 2;
        let source = connect_pool(&config.source, size, "source").await?;
        let target = connect_pool(target_conn, size, "target").await?;
        let introspector = Introspector::new(&config.sync);

        Ok(Self {
            config,
            target_name,
            source,
            target,
            introspector,
        })
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    async fn connection(pool: &Pool, role: &str) -> Result<Object> {
        pool.get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting {} connection", role)))
    }

    async fn snapshot(&self, pool: &Pool, role: &str) -> Result<SchemaSnapshot> {
        let mut conn = Self::connection(pool, role).await?;
        self.introspector.snapshot(&mut conn, role).await
    }

    async fn snapshots(&self) -> Result<(SchemaSnapshot, SchemaSnapshot)> {
        let source = self.snapshot(&self.source, "source").await?;
        let target = self.snapshot(&self.target, "target").await?;
        Ok((source, target))
    }

    fn history(&self) -> HistoryWriter {
        HistoryWriter::new(&self.config.sync.history_dir, &self.target_name)
    }

    fn engine(&self) -> DataMigrationEngine {
        DataMigrationEngine::new(
            self.source.clone(),
            self.target.clone(),
            self.config.sync.schema.clone(),
            self.config.data.clone(),
        )
    }

    /// Schema sync, optionally followed by the data migration.
    pub async fn sync(&self, opts: &SyncOptions) -> Result<SyncResult> {
        let started_at = Utc::now();
        info!("Starting schema sync to target {}", self.target_name);
        let (source, target) = self.snapshots().await?;

        if opts.verify_only {
            let report = verify_snapshots(&source, &target);
            report.log();
            let mut result = SyncResult::new(&self.target_name, "verified", started_at);
            result.verify = Some(report);
            return Ok(result.finish());
        }

        let diff_opts = DiffOptions {
            use_alter: opts.use_alter,
            fk_mode: opts.fk_mode,
            install_extensions: opts.install_extensions,
            extension_allowlist: self.config.sync.extension_allowlist.clone(),
        };
        let plan = generate_plan(&source, &target, &diff_opts);
        info!(
            "Plan: {} blocks, {} objects up to date",
            plan.blocks.len(),
            plan.skipped.len()
        );

        let history = self.history();
        let mut result = SyncResult::new(&self.target_name, "generated", started_at);
        result.summary = plan
            .summary()
            .into_iter()
            .map(|(c, n)| (c.label().to_string(), n))
            .collect();
        result.blocks_total = plan.blocks.len();
        result.skipped_objects = plan.skipped.len();
        result.recreated_tables = plan.recreated_tables.iter().cloned().collect();
        result.warnings = plan.warnings.clone();
        result.migration_file = Some(history.write_migration(&plan.render())?);
        result.skip_file = Some(history.write_skip(&plan.render_skipped())?);
        result.validate_file = history.append_validate(&plan.validate_statements)?;

        if !opts.commit {
            if opts.with_data {
                warn!("--with-data needs the schema applied; skipping data migration");
            }
            info!("Not committing; review {}", history.migration_path().display());
            return Ok(result.finish());
        }

        if plan.is_empty() {
            info!("Target {} is up to date", self.target_name);
            result.status = "up_to_date".to_string();
        } else {
            let mut conn = Self::connection(&self.target, "target").await?;
            let client: &mut Client = &mut conn;
            let report = apply_blocks(client, &plan.blocks).await;
            result.blocks_applied = report.blocks_applied;
            if report.failure.is_some() {
                error!(
                    "Applied {} of {} blocks to {} before a failure; script at {}",
                    report.blocks_applied,
                    report.blocks_total,
                    self.target_name,
                    history.migration_path().display()
                );
            }
            report.into_result()?;
            info!("Applied {} blocks to {}", result.blocks_applied, self.target_name);
            result.status = "applied".to_string();
        }

        if opts.with_data {
            // Re-read the target so the engine sees the applied schema.
            let target = self.snapshot(&self.target, "target").await?;
            let report = self.engine().run(&source, &target).await?;
            if let Some(path) = history.append_validate(&report.validate_statements)? {
                result.validate_file = Some(path);
            }
            if !report.is_complete() {
                result.status = "partial".to_string();
            }
            result.data = Some(report);
        }

        Ok(result.finish())
    }

    /// Full parallel data migration against the current target schema.
    pub async fn migrate_data(&self) -> Result<DataResult> {
        let (source, target) = self.snapshots().await?;
        let report = self.engine().run(&source, &target).await?;
        let validate_file = self.history().append_validate(&report.validate_statements)?;
        Ok(self.data_result(report, validate_file))
    }

    /// Load one table. Constraints are left in place.
    pub async fn migrate_table(&self, table: &str) -> Result<DataResult> {
        let (source, target) = self.snapshots().await?;
        let report = self.engine().migrate_table(table, &source, &target).await?;
        Ok(self.data_result(report, None))
    }

    fn data_result(&self, report: DataMigrationReport, validate_file: Option<PathBuf>) -> DataResult {
        let status = if report.is_complete() { "completed" } else { "partial" };
        DataResult {
            target: self.target_name.clone(),
            status: status.to_string(),
            validate_file,
            report,
        }
    }

    /// Run a validate file, the newest one for this target by default.
    pub async fn validate_fks(&self, file: Option<PathBuf>) -> Result<ValidateResult> {
        let file = match file {
            Some(f) => Some(f),
            None => latest_validate_file(&self.config.sync.history_dir, Some(&self.target_name))?,
        };
        let Some(path) = file else {
            warn!(
                "No validate file found in {}",
                self.config.sync.history_dir.display()
            );
            return Ok(ValidateResult {
                target: self.target_name.clone(),
                file: None,
                statements_executed: 0,
            });
        };

        let contents = std::fs::read_to_string(&path)?;
        let statements = parse_validate_file(&contents);
        info!(
            "Validating {} constraints from {}",
            statements.len(),
            path.display()
        );
        let mut conn = Self::connection(&self.target, "target").await?;
        let client: &mut Client = &mut conn;
        let executed = run_validate_statements(client, &statements).await?;

        Ok(ValidateResult {
            target: self.target_name.clone(),
            file: Some(path),
            statements_executed: executed,
        })
    }

    /// Constraints on the target that are still `NOT VALID`.
    pub async fn check_schema(&self) -> Result<CheckSchemaResult> {
        let conn = Self::connection(&self.target, "target").await?;
        let unvalidated = unvalidated_constraints(&conn, &self.config.sync.schema).await?;
        if unvalidated.is_empty() {
            info!("All constraints on {} are validated", self.target_name);
        }
        for c in &unvalidated {
            warn!(
                "{} {} on {} is NOT VALID",
                c.constraint_type, c.constraint, c.table
            );
        }
        Ok(CheckSchemaResult {
            target: self.target_name.clone(),
            unvalidated,
        })
    }

    /// Row counts of every table present on both sides.
    pub async fn check_data(&self) -> Result<CheckDataResult> {
        let (source, target) = self.snapshots().await?;
        let common: Vec<String> = source
            .tables
            .keys()
            .filter(|t| target.tables.contains_key(*t))
            .cloned()
            .collect();
        let source_conn = Self::connection(&self.source, "source").await?;
        let target_conn = Self::connection(&self.target, "target").await?;
        let check = check_row_counts(&source_conn, &target_conn, &self.config.sync.schema, &common).await?;
        Ok(CheckDataResult {
            target: self.target_name.clone(),
            check,
        })
    }

    /// Connect to both sides and measure a round trip.
    ///
    /// Connection failures are reported in the result, not returned.
    pub async fn health_check(config: &Config, target: Option<&str>) -> Result<HealthCheckResult> {
        let (_, target_conn) = config.target(target)?;
        let source = endpoint_health(&config.source.describe(), connect_and_ping(&config.source, "source").await);
        let target = endpoint_health(&target_conn.describe(), connect_and_ping(target_conn, "target").await);
        Ok(HealthCheckResult {
            healthy: source.connected && target.connected,
            source,
            target,
        })
    }
}

async fn connect_and_ping(conn: &crate::config::ConnectionConfig, role: &str) -> Result<u64> {
    let started = Instant::now();
    let pool = connect_pool(conn, 1, role).await?;
    let rtt = ping(&pool, role).await?;
    info!(
        "{} reachable (connect {}ms, query {}ms)",
        role,
        started.elapsed().as_millis(),
        rtt.as_millis()
    );
    Ok(rtt.as_millis() as u64)
}

fn endpoint_health(endpoint: &str, outcome: Result<u64>) -> EndpointHealth {
    match outcome {
        Ok(ms) => EndpointHealth {
            endpoint: endpoint.to_string(),
            connected: true,
            latency_ms: Some(ms),
            error: None,
        },
        Err(e) => {
            warn!("{} unreachable: {}", endpoint, e);
            EndpointHealth {
                endpoint: endpoint.to_string(),
                connected: false,
                latency_ms: None,
                error: Some(e.to_string()),
            }
        }
    }
}
