//! Timestamped SQL files written under the history directory.
//!
//! - `migrate.<target>.<ts>.sql`: the rendered plan
//! - `skip.<target>.<ts>.sql`: commented DDL of up-to-date objects
//! - `validate_fks.<target>.<ts>.sql`: deferred `VALIDATE CONSTRAINT` statements

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::error::Result;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const VALIDATE_PREFIX: &str = "validate_fks.";

/// Writes the history files of one run against one target.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    dir: PathBuf,
    target: String,
    timestamp: String,
}

impl HistoryWriter {
    pub fn new(dir: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self::with_timestamp(dir, target, Local::now().format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn with_timestamp(dir: impl Into<PathBuf>, target: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            target: target.into(),
            timestamp: timestamp.into(),
        }
    }

    fn path(&self, kind: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}.sql", kind, self.target, self.timestamp))
    }

    pub fn migration_path(&self) -> PathBuf {
        self.path("migrate")
    }

    pub fn skip_path(&self) -> PathBuf {
        self.path("skip")
    }

    pub fn validate_path(&self) -> PathBuf {
        self.path("validate_fks")
    }

    fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, path)?;
        Ok(())
    }

    /// Write the migration file.
    pub fn write_migration(&self, contents: &str) -> Result<PathBuf> {
        let path = self.migration_path();
        self.write_atomic(&path, contents)?;
        info!("Wrote migration to {}", path.display());
        Ok(path)
    }

    /// Write the skip file.
    pub fn write_skip(&self, contents: &str) -> Result<PathBuf> {
        let path = self.skip_path();
        self.write_atomic(&path, contents)?;
        info!("Wrote skip log to {}", path.display());
        Ok(path)
    }

    /// Append statements to this run's validate file, creating it with a
    /// header on first use. Nothing is written for an empty list.
    pub fn append_validate(&self, statements: &[String]) -> Result<Option<PathBuf>> {
        if statements.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.validate_path();
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if is_new {
            writeln!(
                file,
                "-- Deferred foreign key validation for target {} ({})",
                self.target, self.timestamp
            )?;
            writeln!(
                file,
                "-- Each statement scans the referencing table; run in a low-traffic window."
            )?;
        }
        for stmt in statements {
            writeln!(file, "{}", stmt)?;
        }
        info!(
            "Wrote {} validate statements to {}",
            statements.len(),
            path.display()
        );
        Ok(Some(path))
    }
}

/// Newest `validate_fks.*.sql` in `dir`, optionally for one target.
///
/// Files are ordered by their timestamp part; `None` if there are none or
/// the directory does not exist.
pub fn latest_validate_file(dir: &Path, target: Option<&str>) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<(String, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(middle) = name
            .strip_prefix(VALIDATE_PREFIX)
            .and_then(|rest| rest.strip_suffix(".sql"))
        else {
            continue;
        };
        let Some((file_target, ts)) = middle.rsplit_once('.') else {
            continue;
        };
        if target.is_some_and(|t| t != file_target) {
            continue;
        }
        if best.as_ref().map_or(true, |(b, _)| ts > b.as_str()) {
            best = Some((ts.to_string(), path.clone()));
        }
    }
    Ok(best.map(|(_, p)| p))
}
