//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database the schema and data are read from.
    pub source: ConnectionConfig,

    /// Named databases that are brought in line with the source.
    pub targets: BTreeMap<String, ConnectionConfig>,

    /// Schema diff behavior.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Data migration behavior.
    #[serde(default)]
    pub data: DataConfig,
}

/// Connection settings for one PostgreSQL database.
///
/// `db`/`database` and `username` are accepted as alternate spellings of
/// `dbname` and `user`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    #[serde(alias = "db", alias = "database")]
    pub dbname: String,

    /// Username.
    #[serde(alias = "username")]
    pub user: String,

    /// Password. Never serialized back out.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// SSL mode (default: "prefer").
    #[serde(default = "default_prefer")]
    pub ssl_mode: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl ConnectionConfig {
    /// `host:port/dbname`, for log lines.
    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.dbname)
    }

    /// True if both configs point at the same database.
    pub fn same_database(&self, other: &ConnectionConfig) -> bool {
        self.host == other.host && self.port == other.port && self.dbname == other.dbname
    }
}

/// Schema diff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Schema to compare on both sides (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Directory for migrate/skip/validate SQL files (default: "history").
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,

    /// Maintenance tables ignored by introspection.
    #[serde(default = "default_exclude_tables")]
    pub exclude_tables: Vec<String>,

    /// Maintenance indexes ignored by introspection.
    #[serde(default = "default_exclude_indexes")]
    pub exclude_indexes: Vec<String>,

    /// Extensions that may be created automatically with `--install-extensions`.
    #[serde(default = "default_extension_allowlist")]
    pub extension_allowlist: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema: default_public_schema(),
            history_dir: default_history_dir(),
            exclude_tables: default_exclude_tables(),
            exclude_indexes: default_exclude_indexes(),
            extension_allowlist: default_extension_allowlist(),
        }
    }
}

/// Data migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Number of (source, target) connection pairs and concurrent table loads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per table before it is reported as permanently failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Rows per multi-row INSERT statement.
    #[serde(default = "default_insert_batch_rows")]
    pub insert_batch_rows: usize,

    /// Constraints dropped or restored per transaction.
    #[serde(default = "default_constraint_batch_size")]
    pub constraint_batch_size: usize,

    /// `lock_timeout` applied to constraint batches, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// High-volume tables never copied.
    #[serde(default = "default_skip_tables")]
    pub skip_tables: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            insert_batch_rows: default_insert_batch_rows(),
            constraint_batch_size: default_constraint_batch_size(),
            lock_timeout_ms: default_lock_timeout_ms(),
            skip_tables: default_skip_tables(),
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_prefer() -> String {
    "prefer".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}

fn default_exclude_tables() -> Vec<String> {
    vec!["databasechangelog".into(), "databasechangeloglock".into()]
}

fn default_exclude_indexes() -> Vec<String> {
    vec!["databasechangeloglock_pkey".into()]
}

fn default_extension_allowlist() -> Vec<String> {
    [
        "pgcrypto",
        "uuid-ossp",
        "pg_trgm",
        "citext",
        "hstore",
        "btree_gin",
        "btree_gist",
        "unaccent",
        "fuzzystrmatch",
        "pg_stat_statements",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_workers() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    10
}

fn default_insert_batch_rows() -> usize {
    1_000
}

fn default_constraint_batch_size() -> usize {
    50
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_skip_tables() -> Vec<String> {
    vec!["slow_request_logs".into(), "member_action_log".into()]
}
