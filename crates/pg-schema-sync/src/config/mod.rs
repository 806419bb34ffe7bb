//! Configuration loading, validation and target selection.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| MigrateError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Resolve the target to operate on.
    ///
    /// An explicit name must exist in `targets`. Without a name the config
    /// must define exactly one target.
    pub fn target(&self, name: Option<&str>) -> Result<(&str, &ConnectionConfig)> {
        match name {
            Some(name) => self
                .targets
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| {
                    MigrateError::Config(format!(
                        "unknown target '{}'. Available: {}",
                        name,
                        self.target_names().join(", ")
                    ))
                }),
            None => {
                let mut iter = self.targets.iter();
                match (iter.next(), iter.next()) {
                    (Some((k, v)), None) => Ok((k.as_str(), v)),
                    _ => Err(MigrateError::Config(format!(
                        "--target is required when several targets are configured: {}",
                        self.target_names().join(", ")
                    ))),
                }
            }
        }
    }

    /// Configured target names, sorted.
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }
}
