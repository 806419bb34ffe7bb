//! Configuration validation.

use super::{Config, ConnectionConfig};
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_connection("source", &config.source)?;

    if config.targets.is_empty() {
        return Err(MigrateError::Config(
            "at least one entry under targets is required".into(),
        ));
    }
    for (name, target) in &config.targets {
        validate_connection(&format!("targets.{}", name), target)?;

        // Cannot sync a database onto itself
        if target.same_database(&config.source) {
            return Err(MigrateError::Config(format!(
                "targets.{} points at the source database",
                name
            )));
        }
    }

    validate_identifier(&config.sync.schema)?;
    for name in config
        .sync
        .exclude_tables
        .iter()
        .chain(&config.sync.exclude_indexes)
        .chain(&config.data.skip_tables)
    {
        validate_identifier(name)?;
    }

    let data = &config.data;
    if data.workers == 0 {
        return Err(MigrateError::Config("data.workers must be at least 1".into()));
    }
    if data.max_attempts == 0 {
        return Err(MigrateError::Config(
            "data.max_attempts must be at least 1".into(),
        ));
    }
    if data.insert_batch_rows == 0 {
        return Err(MigrateError::Config(
            "data.insert_batch_rows must be at least 1".into(),
        ));
    }
    if data.constraint_batch_size == 0 {
        return Err(MigrateError::Config(
            "data.constraint_batch_size must be at least 1".into(),
        ));
    }
    if data.lock_timeout_ms == 0 {
        return Err(MigrateError::Config(
            "data.lock_timeout_ms must be at least 1".into(),
        ));
    }

    Ok(())
}

fn validate_connection(section: &str, conn: &ConnectionConfig) -> Result<()> {
    if conn.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", section)));
    }
    if conn.dbname.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.dbname is required",
            section
        )));
    }
    if conn.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", section)));
    }
    Ok(())
}
