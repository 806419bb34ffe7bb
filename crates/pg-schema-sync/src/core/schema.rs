//! Catalog snapshot types.
//!
//! A [`SchemaSnapshot`] is the introspector's description of one schema in
//! one database. Every map is keyed by object name and ordered, so diffing
//! two snapshots is deterministic.

use serde::Serialize;
use std::collections::BTreeMap;

use super::identifier::{qualify, quote_ident, quote_list};

/// Referential action of a foreign key (`ON DELETE` / `ON UPDATE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Decode `pg_constraint.confdeltype` / `confupdtype`.
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => ReferentialAction::Restrict,
            "c" => ReferentialAction::Cascade,
            "n" => ReferentialAction::SetNull,
            "d" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// Single-column foreign key reference carried on a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// Column metadata, in ordinal position order within its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Declared type as rendered by `format_type()`, e.g. `character varying(50)`.
    pub data_type: String,

    /// Underlying type name (`pg_type.typname`), e.g. `varchar`, `_int4`.
    pub udt_name: String,

    /// Whether the column accepts NULL.
    pub nullable: bool,

    /// Default expression text, if any.
    pub default: Option<String>,

    /// Catalog identity column or `nextval(...)` default.
    pub is_identity: bool,

    /// `GENERATED ALWAYS AS IDENTITY`; explicit values need `OVERRIDING SYSTEM VALUE`.
    pub generated_always: bool,

    /// Part of a single-column primary key.
    pub is_primary_key: bool,

    /// Covered by a single-column unique constraint.
    pub is_unique: bool,

    /// Single-column foreign key, if any.
    pub references: Option<ColumnReference>,
}

impl Column {
    /// Convenience constructor for a plain nullable column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            udt_name: data_type.clone(),
            data_type,
            nullable: true,
            default: None,
            is_identity: false,
            generated_always: false,
            is_primary_key: false,
            is_unique: false,
            references: None,
        }
    }

    /// Mark NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as single-column primary key.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    /// Set the default expression. A `nextval(` default implies identity.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        let default = default.into();
        self.is_identity |= default.contains("nextval(");
        self.default = Some(default);
        self
    }

    /// Mark as identity column.
    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self
    }

    /// Mark as `GENERATED ALWAYS AS IDENTITY`.
    pub fn identity_always(mut self) -> Self {
        self.is_identity = true;
        self.generated_always = true;
        self
    }
}

/// Kind of a multi-column constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
}

impl ConstraintKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ConstraintKind::PrimaryKey => "PRIMARY KEY",
            ConstraintKind::Unique => "UNIQUE",
        }
    }
}

/// Multi-column PRIMARY KEY or UNIQUE constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeConstraint {
    pub name: String,
    pub kind: ConstraintKind,
    /// Columns in constraint order.
    pub columns: Vec<String>,
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub composite_constraints: Vec<CompositeConstraint>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            composite_constraints: Vec::new(),
        }
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns, from the composite constraint if there is one,
    /// otherwise from the single-column flags.
    pub fn primary_key(&self) -> Vec<String> {
        if let Some(pk) = self
            .composite_constraints
            .iter()
            .find(|c| c.kind == ConstraintKind::PrimaryKey)
        {
            return pk.columns.clone();
        }
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Identity-backed columns.
    pub fn identity_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_identity)
    }
}

/// Foreign key constraint, single- or multi-column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub name: String,
    /// Owning table.
    pub table: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    /// Constraint definition as reported by `pg_get_constraintdef()`.
    pub definition: String,
}

impl ForeignKey {
    /// Build a descriptor from its parts, rendering the definition the way
    /// `pg_get_constraintdef()` does.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        ref_table: impl Into<String>,
        ref_columns: Vec<String>,
        on_delete: ReferentialAction,
        on_update: ReferentialAction,
    ) -> Self {
        let ref_table = ref_table.into();
        let mut definition = format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            quote_list(&columns),
            quote_ident(&ref_table),
            quote_list(&ref_columns)
        );
        if on_update != ReferentialAction::NoAction {
            definition.push_str(&format!(" ON UPDATE {}", on_update.as_sql()));
        }
        if on_delete != ReferentialAction::NoAction {
            definition.push_str(&format!(" ON DELETE {}", on_delete.as_sql()));
        }
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            ref_table,
            ref_columns,
            on_delete,
            on_update,
            definition,
        }
    }

    /// Map key: `table.constraint`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }

    /// Definition with any trailing `NOT VALID` removed.
    pub fn bare_definition(&self) -> &str {
        self.definition
            .trim_end()
            .strip_suffix("NOT VALID")
            .map(str::trim_end)
            .unwrap_or(self.definition.trim_end())
    }
}

/// Secondary or primary-key index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Index {
    pub name: String,
    /// Table the index belongs to.
    pub table: String,
    /// `CREATE INDEX` statement as reported by `pg_indexes`.
    pub ddl: String,
}

/// Enum type with its values sorted for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumType {
    pub name: String,
    /// Values sorted by content.
    pub values: Vec<String>,
    /// `CREATE TYPE` statement with values in declared order.
    pub ddl: String,
}

/// Standalone sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sequence {
    pub name: String,
    pub data_type: String,
    pub start_value: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub increment_by: i64,
    pub cache_size: i64,
    pub cycle: bool,
    pub last_value: i64,
    pub is_called: bool,
}

impl Sequence {
    /// Value the next `nextval()` will return.
    pub fn next_value(&self) -> i64 {
        if self.is_called {
            self.last_value.saturating_add(self.increment_by)
        } else {
            self.last_value
        }
    }

    /// Position equality, the comparison key for the diff.
    pub fn same_position(&self, other: &Sequence) -> bool {
        self.last_value == other.last_value && self.is_called == other.is_called
    }

    /// `CREATE SEQUENCE IF NOT EXISTS` with every option spelled out.
    pub fn create_sql(&self, schema: &str) -> String {
        format!(
            "CREATE SEQUENCE IF NOT EXISTS {} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} CACHE {}{};",
            qualify(schema, &self.name),
            self.data_type,
            self.increment_by,
            self.min_value,
            self.max_value,
            self.start_value,
            self.cache_size,
            if self.cycle { " CYCLE" } else { " NO CYCLE" }
        )
    }
}

/// Everything the introspector reports for one schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub schema: String,
    pub enums: BTreeMap<String, EnumType>,
    pub tables: BTreeMap<String, Table>,
    /// Keyed by `table.constraint`.
    pub foreign_keys: BTreeMap<String, ForeignKey>,
    /// View name to `CREATE OR REPLACE VIEW` text.
    pub views: BTreeMap<String, String>,
    /// `name(args)` to `CREATE OR REPLACE FUNCTION` text.
    pub functions: BTreeMap<String, String>,
    /// Secondary indexes.
    pub indexes: BTreeMap<String, Index>,
    /// Primary key indexes, kept for reporting only.
    pub pkey_indexes: BTreeMap<String, Index>,
    pub sequences: BTreeMap<String, Sequence>,
    /// Extension name to installed version.
    pub extensions: BTreeMap<String, String>,
}

impl SchemaSnapshot {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Default::default()
        }
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKey) {
        self.foreign_keys.insert(fk.key(), fk);
    }
}
