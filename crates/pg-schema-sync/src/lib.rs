//! # pg-schema-sync
//!
//! PostgreSQL-to-PostgreSQL schema synchronization and data migration.
//!
//! - **Introspection** of enums, tables, views, functions, indexes,
//!   sequences, extensions and foreign keys into a [`SchemaSnapshot`]
//! - **Diff and DDL generation** producing an ordered [`MigrationPlan`] and
//!   a skip log, never dropping target-only objects
//! - **Plan execution** with one committed transaction per block
//! - **Parallel data migration** with FK neutralization, retry rounds,
//!   sequence reconciliation and row-count checks
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_schema_sync::{Config, Orchestrator, SyncOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config, Some("staging")).await?;
//!     let result = orchestrator.sync(&SyncOptions::default()).await?;
//!     println!("Applied {} of {} blocks", result.blocks_applied, result.blocks_total);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod connect;
pub mod core;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod introspect;
pub mod orchestrator;
pub mod transfer;
pub mod verify;

// Re-exports for convenient access
pub use config::{Config, ConnectionConfig, DataConfig, SyncConfig};
pub use crate::core::{SchemaSnapshot, SqlValue};
pub use diff::{generate_plan, DiffOptions, FkMode, MigrationPlan, SqlBlock};
pub use error::{MigrateError, Result};
pub use executor::{apply_blocks, ExecutionReport};
pub use graph::DependencyGraph;
pub use introspect::Introspector;
pub use orchestrator::{
    CheckDataResult, CheckSchemaResult, DataResult, HealthCheckResult, JsonReport, Orchestrator,
    SyncOptions, SyncResult, ValidateResult,
};
pub use transfer::{DataMigrationEngine, DataMigrationReport};
pub use verify::VerifyReport;
