//! Schema diff and DDL generation.
//!
//! [`generate_plan`] compares a source and a target [`SchemaSnapshot`] one
//! object category at a time and returns a [`MigrationPlan`]: ordered SQL
//! blocks that bring the target in line with the source, plus a commented
//! skip log of everything already up to date.
//!
//! Target-only objects are never dropped. Existing foreign keys are never
//! dropped either; a missing or differing one is added.

pub mod foreign_key;
pub mod normalize;
pub mod table;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::identifier::{qualify, quote_ident, quote_ident_min, quote_literal};
use crate::core::{Index, SchemaSnapshot};
use crate::graph::DependencyGraph;

pub use foreign_key::{add_constraint_sql, validate_statements_from};
pub use normalize::normalize_sql;
pub use table::{
    compare_tables, create_table_sql, is_safe_type_change, recreate_table_sql, TableChange,
};

/// Object categories, in the order their blocks appear in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectCategory {
    Extension,
    EnumType,
    Sequence,
    Table,
    View,
    Function,
    Index,
    ForeignKey,
}

impl ObjectCategory {
    /// Keyword used in SQL and block headers.
    pub fn label(&self) -> &'static str {
        match self {
            ObjectCategory::Extension => "EXTENSION",
            ObjectCategory::EnumType => "TYPE",
            ObjectCategory::Sequence => "SEQUENCE",
            ObjectCategory::Table => "TABLE",
            ObjectCategory::View => "VIEW",
            ObjectCategory::Function => "FUNCTION",
            ObjectCategory::Index => "INDEX",
            ObjectCategory::ForeignKey => "FOREIGN KEY",
        }
    }
}

impl fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How foreign keys are handled by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FkMode {
    /// Add missing foreign keys, validated immediately.
    #[default]
    Add,
    /// Add missing foreign keys as `NOT VALID` and list `VALIDATE` statements.
    NotValid,
    /// Leave foreign keys alone.
    Skip,
}

/// Generator switches.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Alter tables in place where the column-change matrix allows it.
    pub use_alter: bool,
    pub fk_mode: FkMode,
    /// Emit `CREATE EXTENSION` for allow-listed extensions missing on the target.
    pub install_extensions: bool,
    pub extension_allowlist: Vec<String>,
}

/// One unit of migration SQL, applied and committed on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlBlock {
    pub category: ObjectCategory,
    /// Object name.
    pub name: String,
    /// SQL text, starting with a `-- ` provenance comment.
    pub sql: String,
}

impl SqlBlock {
    fn new(category: ObjectCategory, name: &str, header: String, body: &str) -> Self {
        Self {
            category,
            name: name.to_string(),
            sql: format!("-- {}\n{}", header, body),
        }
    }
}

/// Ordered migration output for one source/target pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationPlan {
    pub blocks: Vec<SqlBlock>,
    /// Commented-out DDL of objects that are already up to date.
    pub skipped: Vec<String>,
    /// `VALIDATE CONSTRAINT` statements for foreign keys added as `NOT VALID`.
    pub validate_statements: Vec<String>,
    /// Things the generator could not do.
    pub warnings: Vec<String>,
    /// Tables dropped and re-created by this plan.
    pub recreated_tables: BTreeSet<String>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Migration file contents.
    pub fn render(&self) -> String {
        join_sections(self.blocks.iter().map(|b| b.sql.as_str()))
    }

    /// Skip file contents.
    pub fn render_skipped(&self) -> String {
        join_sections(self.skipped.iter().map(String::as_str))
    }

    /// Number of blocks per category.
    pub fn summary(&self) -> BTreeMap<ObjectCategory, usize> {
        let mut counts = BTreeMap::new();
        for block in &self.blocks {
            *counts.entry(block.category).or_insert(0) += 1;
        }
        counts
    }

    fn push(&mut self, block: SqlBlock) {
        debug!("{} {}: {}", block.category, block.name, first_line(&block.sql));
        self.blocks.push(block);
    }

    fn skip(&mut self, category: ObjectCategory, name: &str, ddl: &str) {
        let commented = ddl
            .lines()
            .map(|l| format!("-- {}", l))
            .collect::<Vec<_>>()
            .join("\n");
        self.skipped.push(format!(
            "-- {} {} is up-to-date; skipping.\n{}",
            category, name, commented
        ));
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

fn join_sections<'a>(sections: impl Iterator<Item = &'a str>) -> String {
    let mut out = sections.collect::<Vec<_>>().join("\n\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

/// Anything with a DDL text comparable after normalization.
trait Ddl {
    fn ddl(&self) -> &str;
}

impl Ddl for String {
    fn ddl(&self) -> &str {
        self
    }
}

impl Ddl for Index {
    fn ddl(&self) -> &str {
        &self.ddl
    }
}

/// Compare two snapshots and produce the migration plan.
pub fn generate_plan(
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    opts: &DiffOptions,
) -> MigrationPlan {
    let schema = source.schema.as_str();
    let mut plan = MigrationPlan::default();

    diff_extensions(&mut plan, source, target, opts);
    diff_enums(&mut plan, schema, source, target);
    diff_sequences(&mut plan, schema, source, target);
    diff_tables(&mut plan, schema, source, target, opts.use_alter);

    // Views may depend on any recreated table and were dropped with it.
    let tables_recreated = !plan.recreated_tables.is_empty();
    diff_ddl_objects(
        &mut plan,
        ObjectCategory::View,
        schema,
        &source.views,
        &target.views,
        |_| tables_recreated,
    );
    diff_ddl_objects(
        &mut plan,
        ObjectCategory::Function,
        schema,
        &source.functions,
        &target.functions,
        |_| false,
    );

    let recreated = plan.recreated_tables.clone();
    diff_ddl_objects(
        &mut plan,
        ObjectCategory::Index,
        schema,
        &source.indexes,
        &target.indexes,
        |name| {
            source
                .indexes
                .get(name)
                .is_some_and(|idx| recreated.contains(&idx.table))
        },
    );

    diff_foreign_keys(&mut plan, schema, source, target, opts.fk_mode);

    plan
}

fn diff_extensions(
    plan: &mut MigrationPlan,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    opts: &DiffOptions,
) {
    for name in source.extensions.keys() {
        let create = format!("CREATE EXTENSION IF NOT EXISTS {};", quote_ident(name));
        if target.extensions.contains_key(name) {
            plan.skip(ObjectCategory::Extension, name, &create);
        } else if opts.install_extensions && opts.extension_allowlist.contains(name) {
            plan.push(SqlBlock::new(
                ObjectCategory::Extension,
                name,
                format!("CREATE EXTENSION {}", name),
                &create,
            ));
        } else if opts.install_extensions {
            plan.warn(format!(
                "Extension {} is missing on target and not in the allow-list; install it manually",
                name
            ));
        } else {
            plan.warn(format!(
                "Extension {} is missing on target; rerun with --install-extensions or install it manually",
                name
            ));
        }
    }
}

fn diff_enums(plan: &mut MigrationPlan, schema: &str, source: &SchemaSnapshot, target: &SchemaSnapshot) {
    let category = ObjectCategory::EnumType;
    for (name, src) in &source.enums {
        match target.enums.get(name) {
            None => plan.push(SqlBlock::new(
                category,
                name,
                format!("CREATE TYPE {}", name),
                &src.ddl,
            )),
            Some(tgt) if tgt.values == src.values => plan.skip(category, name, &src.ddl),
            Some(_) => plan.push(SqlBlock::new(
                category,
                name,
                format!("TYPE {} differs. Recreating.", name),
                &format!(
                    "-- WARNING: CASCADE also drops columns and defaults that use this type.\n\
                     DROP TYPE IF EXISTS {} CASCADE;\n{}",
                    qualify(schema, name),
                    src.ddl
                ),
            )),
        }
    }
}

fn diff_sequences(
    plan: &mut MigrationPlan,
    schema: &str,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
) {
    let category = ObjectCategory::Sequence;
    for (name, src) in &source.sequences {
        let create = src.create_sql(schema);
        match target.sequences.get(name) {
            None => {
                let mut body = create;
                if src.is_called {
                    body.push_str(&format!(
                        "\nSELECT setval({}, {}, true);",
                        quote_literal(&qualify(schema, name)),
                        src.last_value
                    ));
                }
                plan.push(SqlBlock::new(category, name, format!("CREATE SEQUENCE {}", name), &body));
            }
            Some(tgt) if tgt.same_position(src) => plan.skip(category, name, &create),
            Some(_) => plan.push(SqlBlock::new(
                category,
                name,
                format!("SEQUENCE {} differs. Restarting.", name),
                &format!(
                    "ALTER SEQUENCE {} RESTART WITH {};",
                    qualify(schema, name),
                    src.next_value()
                ),
            )),
        }
    }
}

fn diff_tables(
    plan: &mut MigrationPlan,
    schema: &str,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    use_alter: bool,
) {
    let category = ObjectCategory::Table;
    let order = DependencyGraph::build(source.tables.keys(), source.foreign_keys.values())
        .topological_order()
        .order;

    for name in &order {
        let Some(src) = source.tables.get(name) else {
            continue;
        };
        let create = create_table_sql(schema, src);
        let Some(tgt) = target.tables.get(name) else {
            plan.push(SqlBlock::new(category, name, format!("CREATE TABLE {}", name), &create));
            continue;
        };

        match compare_tables(schema, src, tgt, use_alter) {
            TableChange::Unchanged => plan.skip(category, name, &create),
            TableChange::Alter(statements) => plan.push(SqlBlock::new(
                category,
                name,
                format!("TABLE {} differs. Altering columns.", name),
                &statements.join("\n"),
            )),
            TableChange::Recreate => {
                plan.recreated_tables.insert(name.clone());
                plan.push(SqlBlock::new(
                    category,
                    name,
                    format!("TABLE {} differs. Recreating.", name),
                    &recreate_table_sql(schema, src, tgt),
                ));
            }
        }
    }
}

/// Views, functions and indexes: normalized DDL equality, DROP + CREATE on
/// difference. `force` marks objects that must be rebuilt regardless.
fn diff_ddl_objects<V: Ddl>(
    plan: &mut MigrationPlan,
    category: ObjectCategory,
    schema: &str,
    source: &BTreeMap<String, V>,
    target: &BTreeMap<String, V>,
    force: impl Fn(&str) -> bool,
) {
    for (name, src) in source {
        let ddl = src.ddl();
        let create = match category {
            ObjectCategory::Index => guarded_index_sql(schema, name, ddl),
            _ => ddl.to_string(),
        };

        match target.get(name) {
            None => plan.push(SqlBlock::new(
                category,
                name,
                format!("CREATE {} {}", category, name),
                &create,
            )),
            Some(tgt) if !force(name) && normalize_sql(tgt.ddl()) == normalize_sql(ddl) => {
                plan.skip(category, name, ddl)
            }
            Some(_) => plan.push(SqlBlock::new(
                category,
                name,
                format!("{} {} differs. Recreating.", category, name),
                &format!("{}\n{}", drop_sql(category, schema, name), create),
            )),
        }
    }
}

fn drop_sql(category: ObjectCategory, schema: &str, name: &str) -> String {
    match category {
        ObjectCategory::Function => {
            // Key is name(identity args)
            let (fname, args) = name.split_once('(').unwrap_or((name, ")"));
            format!(
                "DROP FUNCTION IF EXISTS {}.{}({} CASCADE;",
                quote_ident_min(schema),
                quote_ident_min(fname),
                args
            )
        }
        ObjectCategory::Index => format!("DROP INDEX IF EXISTS {};", qualify(schema, name)),
        other => format!(
            "DROP {} IF EXISTS {} CASCADE;",
            other.label(),
            qualify(schema, name)
        ),
    }
}

/// Wrap `CREATE INDEX` in an existence check so reruns are harmless.
fn guarded_index_sql(schema: &str, name: &str, ddl: &str) -> String {
    format!(
        "DO $$\n\
         BEGIN\n\
         \x20   IF NOT EXISTS (\n\
         \x20       SELECT 1 FROM pg_class c\n\
         \x20       JOIN pg_namespace n ON n.oid = c.relnamespace\n\
         \x20       WHERE c.relname = {} AND n.nspname = {}\n\
         \x20   ) THEN\n\
         \x20       {}\n\
         \x20   END IF;\n\
         END\n\
         $$;",
        quote_literal(name),
        quote_literal(schema),
        ddl
    )
}

fn diff_foreign_keys(
    plan: &mut MigrationPlan,
    schema: &str,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    mode: FkMode,
) {
    if mode == FkMode::Skip {
        return;
    }
    let category = ObjectCategory::ForeignKey;
    let not_valid = mode == FkMode::NotValid;
    let mut conflicting = Vec::new();

    for (key, fk) in &source.foreign_keys {
        let add = add_constraint_sql(schema, fk, not_valid);
        let rebuilt = plan.recreated_tables.contains(&fk.table)
            || plan.recreated_tables.contains(&fk.ref_table);

        match target.foreign_keys.get(key) {
            None => plan.push(SqlBlock::new(category, key, format!("CREATE FOREIGN KEY {}", key), &add)),
            Some(_) if rebuilt => plan.push(SqlBlock::new(
                category,
                key,
                format!("FOREIGN KEY {} dropped with a recreated table. Re-adding.", key),
                &add,
            )),
            Some(tgt)
                if normalize_sql(&add_constraint_sql(schema, tgt, false))
                    == normalize_sql(&add_constraint_sql(schema, fk, false)) =>
            {
                plan.skip(category, key, &add_constraint_sql(schema, fk, false))
            }
            Some(_) => conflicting.push(SqlBlock::new(
                category,
                key,
                format!(
                    "FOREIGN KEY {} differs. The existing constraint is kept; drop it manually before this ADD can succeed.",
                    key
                ),
                &add,
            )),
        }
    }

    if !conflicting.is_empty() {
        plan.warn(format!(
            "{} foreign key(s) differ from the source and are not dropped automatically",
            conflicting.len()
        ));
    }
    // Conflicting ADDs go last so every other constraint is applied first.
    for block in conflicting {
        plan.push(block);
    }

    if not_valid {
        plan.validate_statements = validate_statements_from(
            plan.blocks
                .iter()
                .filter(|b| b.category == category)
                .flat_map(|b| b.sql.lines())
                .filter(|l| !l.starts_with("--")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, EnumType, ForeignKey, ReferentialAction, Sequence, Table};

    fn order_status(values: &[&str]) -> EnumType {
        let quoted = values.iter().map(|v| format!("'{}'", v)).collect::<Vec<_>>().join(", ");
        let mut sorted: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        sorted.sort();
        EnumType {
            name: "order_status".into(),
            values: sorted,
            ddl: format!("CREATE TYPE public.order_status AS ENUM ({});", quoted),
        }
    }

    fn users() -> Table {
        Table::new(
            "users",
            vec![
                Column::new("id", "integer").primary_key().identity(),
                Column::new("email", "text").not_null(),
            ],
        )
    }

    fn orders() -> Table {
        Table::new(
            "orders",
            vec![
                Column::new("id", "integer").primary_key().identity(),
                Column::new("user_id", "integer"),
            ],
        )
    }

    fn orders_fk() -> ForeignKey {
        ForeignKey::new(
            "orders_user_id_fkey",
            "orders",
            vec!["user_id".into()],
            "users",
            vec!["id".into()],
            ReferentialAction::Cascade,
            ReferentialAction::NoAction,
        )
    }

    fn full_snapshot() -> SchemaSnapshot {
        let mut s = SchemaSnapshot::new("public");
        s.enums.insert("order_status".into(), order_status(&["pending", "shipped"]));
        s.add_table(users());
        s.add_table(orders());
        s.add_foreign_key(orders_fk());
        s.views.insert(
            "active_users".into(),
            "CREATE OR REPLACE VIEW public.active_users AS\n SELECT users.id FROM users;".into(),
        );
        s.functions.insert(
            "touch(integer)".into(),
            "CREATE OR REPLACE FUNCTION public.touch(v integer)\n RETURNS integer\n LANGUAGE sql\nAS $function$ SELECT v $function$;".into(),
        );
        s.indexes.insert(
            "orders_user_idx".into(),
            Index {
                name: "orders_user_idx".into(),
                table: "orders".into(),
                ddl: "CREATE INDEX orders_user_idx ON public.orders USING btree (user_id);".into(),
            },
        );
        s.sequences.insert(
            "invoice_no".into(),
            Sequence {
                name: "invoice_no".into(),
                data_type: "bigint".into(),
                start_value: 1,
                min_value: 1,
                max_value: i64::MAX,
                increment_by: 1,
                cache_size: 1,
                cycle: false,
                last_value: 41,
                is_called: true,
            },
        );
        s.extensions.insert("pgcrypto".into(), "1.3".into());
        s
    }

    fn opts() -> DiffOptions {
        DiffOptions {
            extension_allowlist: vec!["pgcrypto".into()],
            ..Default::default()
        }
    }

    // ===== Idempotence =====

    #[test]
    fn test_identical_snapshots_produce_no_blocks() {
        let snap = full_snapshot();
        let plan = generate_plan(&snap, &snap, &opts());
        assert!(plan.is_empty(), "unexpected blocks: {:?}", plan.blocks);
        // enum, 2 tables, fk, view, function, index, sequence, extension
        assert_eq!(plan.skipped.len(), 9);
        assert!(plan.render().is_empty());
    }

    #[test]
    fn test_skip_entries_are_commented() {
        let snap = full_snapshot();
        let plan = generate_plan(&snap, &snap, &opts());
        let view_skip = plan
            .skipped
            .iter()
            .find(|s| s.starts_with("-- VIEW active_users"))
            .unwrap();
        assert!(view_skip.starts_with("-- VIEW active_users is up-to-date; skipping.\n"));
        assert!(view_skip.lines().all(|l| l.starts_with("-- ")));
    }

    // ===== Enums =====

    #[test]
    fn test_enum_value_added_recreates_with_source_ddl() {
        let mut source = SchemaSnapshot::new("public");
        source.enums.insert(
            "order_status".into(),
            order_status(&["pending", "processing", "shipped", "delivered", "cancelled"]),
        );
        let mut target = SchemaSnapshot::new("public");
        target.enums.insert(
            "order_status".into(),
            order_status(&["pending", "processing", "shipped", "delivered"]),
        );

        let plan = generate_plan(&source, &target, &opts());
        assert_eq!(plan.blocks.len(), 1);
        let sql = &plan.blocks[0].sql;
        let drop = sql.find("DROP TYPE IF EXISTS public.order_status CASCADE;").unwrap();
        let create = sql
            .find("CREATE TYPE public.order_status AS ENUM ('pending', 'processing', 'shipped', 'delivered', 'cancelled');")
            .unwrap();
        assert!(drop < create);
    }

    #[test]
    fn test_enum_value_order_ignored() {
        let mut source = SchemaSnapshot::new("public");
        source.enums.insert("order_status".into(), order_status(&["a", "b"]));
        let mut target = SchemaSnapshot::new("public");
        target.enums.insert("order_status".into(), order_status(&["b", "a"]));
        let plan = generate_plan(&source, &target, &opts());
        assert!(plan.is_empty());
        assert!(plan.skipped[0].starts_with("-- TYPE order_status is up-to-date; skipping."));
    }

    #[test]
    fn test_source_only_enum_created() {
        let mut source = SchemaSnapshot::new("public");
        source.enums.insert("order_status".into(), order_status(&["a"]));
        let plan = generate_plan(&source, &SchemaSnapshot::new("public"), &opts());
        assert!(plan.blocks[0].sql.starts_with("-- CREATE TYPE order_status\nCREATE TYPE"));
        assert!(plan.skipped.is_empty());
    }

    // ===== Tables =====

    #[test]
    fn test_add_column_with_alter_is_single_statement() {
        let mut source = SchemaSnapshot::new("public");
        let mut t = users();
        t.columns.push(Column::new("description", "text"));
        source.add_table(t);
        let mut target = SchemaSnapshot::new("public");
        target.add_table(users());

        let plan = generate_plan(&source, &target, &DiffOptions { use_alter: true, ..opts() });
        assert_eq!(plan.blocks.len(), 1);
        assert_eq!(
            plan.blocks[0].sql,
            "-- TABLE users differs. Altering columns.\n\
             ALTER TABLE public.users ADD COLUMN \"description\" text;"
        );
        assert!(plan.recreated_tables.is_empty());
    }

    #[test]
    fn test_tables_created_in_dependency_order() {
        let mut source = SchemaSnapshot::new("public");
        source.add_table(orders());
        source.add_table(users());
        source.add_foreign_key(orders_fk());

        let plan = generate_plan(&source, &SchemaSnapshot::new("public"), &opts());
        let tables: Vec<&str> = plan
            .blocks
            .iter()
            .filter(|b| b.category == ObjectCategory::Table)
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(tables, vec!["users", "orders"]);
        // FK comes after both tables
        assert_eq!(plan.blocks.last().unwrap().category, ObjectCategory::ForeignKey);
    }

    #[test]
    fn test_recreated_table_rebuilds_dependents() {
        let source = full_snapshot();
        let mut target = full_snapshot();
        target
            .tables
            .get_mut("users")
            .unwrap()
            .columns[1]
            .data_type = "integer".into();

        let plan = generate_plan(&source, &target, &opts());
        assert!(plan.recreated_tables.contains("users"));
        let cats: Vec<ObjectCategory> = plan.blocks.iter().map(|b| b.category).collect();
        assert_eq!(
            cats,
            vec![ObjectCategory::Table, ObjectCategory::View, ObjectCategory::ForeignKey]
        );
        assert!(plan.blocks[0].sql.contains("DROP TABLE IF EXISTS public.users CASCADE;"));
        assert!(plan.blocks[0].sql.contains("CREATE TABLE public.\"users\""));
        assert!(plan.blocks[2].sql.contains("Re-adding"));
    }

    #[test]
    fn test_index_rebuilt_with_its_table() {
        let source = full_snapshot();
        let mut target = full_snapshot();
        target.tables.get_mut("orders").unwrap().columns[1].data_type = "text".into();
        let plan = generate_plan(&source, &target, &opts());
        let index = plan
            .blocks
            .iter()
            .find(|b| b.category == ObjectCategory::Index)
            .unwrap();
        assert!(index.sql.contains("DROP INDEX IF EXISTS public.orders_user_idx;"));
        assert!(index.sql.contains("DO $$"));
    }

    #[test]
    fn test_recreated_serial_table_keeps_its_sequence() {
        let snapshot = |name_type: &str| {
            let mut s = SchemaSnapshot::new("public");
            s.add_table(Table::new(
                "users",
                vec![
                    Column::new("id", "integer")
                        .with_default("nextval('users_id_seq'::regclass)")
                        .primary_key(),
                    Column::new("name", name_type),
                ],
            ));
            s.sequences.insert(
                "users_id_seq".into(),
                Sequence {
                    name: "users_id_seq".into(),
                    data_type: "integer".into(),
                    start_value: 1,
                    min_value: 1,
                    max_value: i32::MAX as i64,
                    increment_by: 1,
                    cache_size: 1,
                    cycle: false,
                    last_value: 7,
                    is_called: true,
                },
            );
            s
        };

        let plan = generate_plan(&snapshot("text"), &snapshot("integer"), &opts());
        assert_eq!(plan.blocks.len(), 1);
        let sql = &plan.blocks[0].sql;
        let detach = sql
            .find("ALTER SEQUENCE IF EXISTS public.users_id_seq OWNED BY NONE;")
            .unwrap();
        let drop = sql.find("DROP TABLE IF EXISTS public.users CASCADE;").unwrap();
        let create = sql.find("DEFAULT nextval('users_id_seq'::regclass)").unwrap();
        assert!(detach < drop && drop < create);
        assert!(sql.ends_with("ALTER SEQUENCE public.users_id_seq OWNED BY public.\"users\".\"id\";"));
    }

    // ===== Views, functions, indexes =====

    #[test]
    fn test_function_change_drops_with_signature() {
        let source = full_snapshot();
        let mut target = full_snapshot();
        target
            .functions
            .insert("touch(integer)".into(), "CREATE OR REPLACE FUNCTION public.touch(v integer) RETURNS integer LANGUAGE sql AS $function$ SELECT v + 1 $function$;".into());
        let plan = generate_plan(&source, &target, &opts());
        assert_eq!(plan.blocks.len(), 1);
        assert!(plan.blocks[0]
            .sql
            .starts_with("-- FUNCTION touch(integer) differs. Recreating.\nDROP FUNCTION IF EXISTS public.touch(integer) CASCADE;\n"));
    }

    #[test]
    fn test_formatting_only_difference_skipped() {
        let source = full_snapshot();
        let mut target = full_snapshot();
        target.views.insert(
            "active_users".into(),
            "create or replace view public.active_users as select users.id from users -- same\n;".into(),
        );
        let plan = generate_plan(&source, &target, &opts());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_index_create_is_guarded() {
        let mut source = SchemaSnapshot::new("public");
        source.indexes = full_snapshot().indexes;
        let plan = generate_plan(&source, &SchemaSnapshot::new("public"), &opts());
        let sql = &plan.blocks[0].sql;
        assert!(sql.starts_with("-- CREATE INDEX orders_user_idx\nDO $$"));
        assert!(sql.contains("IF NOT EXISTS"));
        assert!(sql.contains("WHERE c.relname = 'orders_user_idx' AND n.nspname = 'public'"));
        assert!(sql.contains("CREATE INDEX orders_user_idx ON public.orders USING btree (user_id);"));
        assert!(sql.ends_with("$$;"));
    }

    // ===== Sequences =====

    #[test]
    fn test_sequence_position_difference_restarts() {
        let source = full_snapshot();
        let mut target = full_snapshot();
        target.sequences.get_mut("invoice_no").unwrap().last_value = 10;
        let plan = generate_plan(&source, &target, &opts());
        assert_eq!(plan.blocks.len(), 1);
        assert!(plan.blocks[0]
            .sql
            .ends_with("ALTER SEQUENCE public.invoice_no RESTART WITH 42;"));
        assert!(!plan.blocks[0].sql.contains("DROP"));
    }

    #[test]
    fn test_source_only_sequence_created_at_position() {
        let mut source = SchemaSnapshot::new("public");
        source.sequences = full_snapshot().sequences;
        let plan = generate_plan(&source, &SchemaSnapshot::new("public"), &opts());
        let sql = &plan.blocks[0].sql;
        assert!(sql.contains("CREATE SEQUENCE IF NOT EXISTS public.invoice_no"));
        assert!(sql.contains("SELECT setval('public.invoice_no', 41, true);"));
    }

    // ===== Extensions =====

    #[test]
    fn test_extensions_need_flag_and_allowlist() {
        let mut source = SchemaSnapshot::new("public");
        source.extensions.insert("pgcrypto".into(), "1.3".into());
        source.extensions.insert("postgis".into(), "3.4".into());
        let target = SchemaSnapshot::new("public");

        let plan = generate_plan(&source, &target, &opts());
        assert!(plan.is_empty());
        assert_eq!(plan.warnings.len(), 2);

        let plan = generate_plan(&source, &target, &DiffOptions { install_extensions: true, ..opts() });
        assert_eq!(plan.blocks.len(), 1);
        assert!(plan.blocks[0].sql.ends_with("CREATE EXTENSION IF NOT EXISTS \"pgcrypto\";"));
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("postgis"));
    }

    // ===== Foreign keys =====

    fn fk_snapshots() -> (SchemaSnapshot, SchemaSnapshot) {
        let mut source = SchemaSnapshot::new("public");
        source.add_table(users());
        source.add_table(orders());
        source.add_foreign_key(orders_fk());
        let mut target = source.clone();
        target.foreign_keys.clear();
        (source, target)
    }

    #[test]
    fn test_missing_fk_added() {
        let (source, target) = fk_snapshots();
        let plan = generate_plan(&source, &target, &opts());
        assert_eq!(plan.blocks.len(), 1);
        assert!(plan.blocks[0].sql.contains(
            "ALTER TABLE public.\"orders\" ADD CONSTRAINT \"orders_user_id_fkey\" FOREIGN KEY"
        ));
        assert!(plan.validate_statements.is_empty());
    }

    #[test]
    fn test_differing_fk_never_dropped() {
        let (source, mut target) = fk_snapshots();
        let mut changed = orders_fk();
        changed.on_delete = ReferentialAction::SetNull;
        changed.definition = changed.definition.replace("CASCADE", "SET NULL");
        target.add_foreign_key(changed);

        let plan = generate_plan(&source, &target, &opts());
        assert_eq!(plan.blocks.len(), 1);
        let sql = &plan.blocks[0].sql;
        assert!(sql.contains("ADD CONSTRAINT"));
        assert!(!sql.contains("DROP CONSTRAINT"));
        assert!(!sql.contains("\nDROP"));
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_fk_not_valid_emits_validate_list() {
        let (source, target) = fk_snapshots();
        let plan = generate_plan(&source, &target, &DiffOptions { fk_mode: FkMode::NotValid, ..opts() });
        assert!(plan.blocks[0].sql.ends_with(" NOT VALID;"));
        assert_eq!(
            plan.validate_statements,
            vec!["ALTER TABLE public.\"orders\" VALIDATE CONSTRAINT \"orders_user_id_fkey\";".to_string()]
        );
    }

    #[test]
    fn test_fk_skip_mode() {
        let (source, target) = fk_snapshots();
        let plan = generate_plan(&source, &target, &DiffOptions { fk_mode: FkMode::Skip, ..opts() });
        assert!(plan.is_empty());
        assert!(plan.skipped.iter().all(|s| !s.contains("FOREIGN KEY")));
    }

    #[test]
    fn test_render_and_summary() {
        let (source, target) = fk_snapshots();
        let mut target = target;
        target.tables.remove("orders");
        let plan = generate_plan(&source, &target, &opts());
        let rendered = plan.render();
        assert!(rendered.starts_with("-- CREATE TABLE orders\n"));
        assert!(rendered.contains("\n\n-- CREATE FOREIGN KEY orders.orders_user_id_fkey\n"));
        assert!(rendered.ends_with(";\n"));
        let summary = plan.summary();
        assert_eq!(summary[&ObjectCategory::Table], 1);
        assert_eq!(summary[&ObjectCategory::ForeignKey], 1);
    }
}
