//! Schema verification and post-load integrity checks.
//!
//! - [`verify_snapshots`]: per-category comparison of two snapshots, no SQL
//! - [`integrity`]: unvalidated constraints, row counts, deferred FK validation

pub mod integrity;

pub use integrity::{
    check_row_counts, compare_counts, count_rows, parse_validate_file, run_validate_statements,
    unvalidated_constraints, RowCountCheck, RowCountMismatch, UnvalidatedConstraint,
};

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::SchemaSnapshot;

/// Comparison of one object category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub category: String,
    pub source_count: usize,
    pub target_count: usize,
    pub source_only: Vec<String>,
    pub target_only: Vec<String>,
    pub synced: bool,
}

impl CategoryReport {
    fn compare<'a>(
        category: &str,
        source: impl IntoIterator<Item = &'a String>,
        target: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let source: BTreeSet<&String> = source.into_iter().collect();
        let target: BTreeSet<&String> = target.into_iter().collect();
        let source_only: Vec<String> = source.difference(&target).map(|s| s.to_string()).collect();
        let target_only: Vec<String> = target.difference(&source).map(|s| s.to_string()).collect();
        Self {
            category: category.to_string(),
            source_count: source.len(),
            target_count: target.len(),
            synced: source_only.is_empty() && target_only.is_empty(),
            source_only,
            target_only,
        }
    }
}

/// Name-level comparison of two snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub categories: Vec<CategoryReport>,
    /// Primary key indexes present only on the target. Informational.
    pub target_only_pkeys: Vec<String>,
}

impl VerifyReport {
    pub fn is_synced(&self) -> bool {
        self.categories.iter().all(|c| c.synced)
    }

    /// Log one line per category, with differences at warn level.
    pub fn log(&self) {
        for c in &self.categories {
            if c.synced {
                info!("{}: {} in sync", c.category, c.source_count);
                continue;
            }
            warn!(
                "{}: source={} target={} missing on target: [{}] extra on target: [{}]",
                c.category,
                c.source_count,
                c.target_count,
                c.source_only.join(", "),
                c.target_only.join(", ")
            );
        }
        if !self.target_only_pkeys.is_empty() {
            info!(
                "Primary key indexes only on target: {}",
                self.target_only_pkeys.join(", ")
            );
        }
    }
}

/// Compare object names per category.
pub fn verify_snapshots(source: &SchemaSnapshot, target: &SchemaSnapshot) -> VerifyReport {
    let categories = vec![
        CategoryReport::compare("enum types", source.enums.keys(), target.enums.keys()),
        CategoryReport::compare("tables", source.tables.keys(), target.tables.keys()),
        CategoryReport::compare("views", source.views.keys(), target.views.keys()),
        CategoryReport::compare("functions", source.functions.keys(), target.functions.keys()),
        CategoryReport::compare("indexes", source.indexes.keys(), target.indexes.keys()),
    ];
    let target_only_pkeys = target
        .pkey_indexes
        .keys()
        .filter(|k| !source.pkey_indexes.contains_key(*k))
        .cloned()
        .collect();

    VerifyReport {
        categories,
        target_only_pkeys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, Index, Table};

    fn index(name: &str, table: &str) -> Index {
        Index {
            name: name.into(),
            table: table.into(),
            ddl: format!("CREATE UNIQUE INDEX {} ON public.{} USING btree (id);", name, table),
        }
    }

    #[test]
    fn test_identical_snapshots_synced() {
        let mut s = SchemaSnapshot::new("public");
        s.add_table(Table::new("users", vec![Column::new("id", "integer")]));
        let report = verify_snapshots(&s, &s);
        assert!(report.is_synced());
        assert_eq!(report.categories.len(), 5);
        assert_eq!(report.categories[1].source_count, 1);
    }

    #[test]
    fn test_differences_listed_sorted() {
        let mut source = SchemaSnapshot::new("public");
        let mut target = SchemaSnapshot::new("public");
        for t in ["zeta", "alpha", "users"] {
            source.add_table(Table::new(t, vec![]));
        }
        target.add_table(Table::new("users", vec![]));
        target.add_table(Table::new("legacy", vec![]));
        target.views.insert("old_view".into(), "CREATE VIEW ...".into());
        target.pkey_indexes.insert("legacy_pkey".into(), index("legacy_pkey", "legacy"));

        let report = verify_snapshots(&source, &target);
        assert!(!report.is_synced());
        let tables = &report.categories[1];
        assert_eq!(tables.source_only, vec!["alpha", "zeta"]);
        assert_eq!(tables.target_only, vec!["legacy"]);
        assert!(!report.categories[2].synced);
        assert_eq!(report.target_only_pkeys, vec!["legacy_pkey"]);
    }
}
