//! Catalog introspection.
//!
//! Reads `pg_catalog` for one schema and assembles a [`SchemaSnapshot`]. All
//! queries run inside one read-only repeatable-read transaction so the
//! snapshot is consistent.

use std::collections::BTreeMap;

use tokio_postgres::{Client, IsolationLevel, Transaction};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::identifier::qualify;
use crate::core::{
    Column, ColumnReference, CompositeConstraint, ConstraintKind, EnumType, ForeignKey, Index,
    ReferentialAction, SchemaSnapshot, Sequence, Table,
};
use crate::error::{MigrateError, Result};

const ENUMS_QUERY: &str = r#"
    SELECT t.typname::text,
           'CREATE TYPE ' || quote_ident(n.nspname) || '.' || quote_ident(t.typname)
             || ' AS ENUM (' || string_agg(quote_literal(e.enumlabel), ', ' ORDER BY e.enumsortorder)
             || ');'
    FROM pg_type t
    JOIN pg_enum e ON e.enumtypid = t.oid
    JOIN pg_namespace n ON n.oid = t.typnamespace
    WHERE n.nspname = $1
    GROUP BY n.nspname, t.typname
    ORDER BY t.typname
"#;

const TABLES_QUERY: &str = r#"
    SELECT c.relname::text
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p')
      AND NOT c.relispartition
      AND c.relname::text <> ALL($2::text[])
    ORDER BY c.relname
"#;

const COLUMNS_QUERY: &str = r#"
    SELECT c.relname::text,
           a.attname::text,
           format_type(a.atttypid, a.atttypmod),
           t.typname::text,
           NOT a.attnotnull,
           pg_get_expr(d.adbin, d.adrelid),
           a.attidentity <> '',
           a.attidentity = 'a'
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_type t ON t.oid = a.atttypid
    LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p')
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY c.relname, a.attnum
"#;

const KEY_CONSTRAINTS_QUERY: &str = r#"
    SELECT cl.relname::text,
           con.conname::text,
           con.contype::text,
           array_agg(a.attname::text ORDER BY k.ord)
    FROM pg_constraint con
    JOIN pg_class cl ON cl.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = cl.relnamespace
    CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
    WHERE n.nspname = $1 AND con.contype IN ('p', 'u')
    GROUP BY cl.relname, con.conname, con.contype
    ORDER BY cl.relname, con.conname
"#;

const FOREIGN_KEYS_QUERY: &str = r#"
    SELECT con.conname::text,
           cl.relname::text,
           ARRAY(SELECT a.attname::text
                 FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                 JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                 ORDER BY k.ord),
           rcl.relname::text,
           ARRAY(SELECT a.attname::text
                 FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                 JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                 ORDER BY k.ord),
           con.confdeltype::text,
           con.confupdtype::text,
           pg_get_constraintdef(con.oid)
    FROM pg_constraint con
    JOIN pg_class cl ON cl.oid = con.conrelid
    JOIN pg_class rcl ON rcl.oid = con.confrelid
    JOIN pg_namespace n ON n.oid = cl.relnamespace
    WHERE n.nspname = $1 AND con.contype = 'f'
    ORDER BY cl.relname, con.conname
"#;

const VIEWS_QUERY: &str = r#"
    SELECT c.relname::text, pg_get_viewdef(c.oid, true)
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relkind = 'v'
    ORDER BY c.relname
"#;

const FUNCTIONS_QUERY: &str = r#"
    SELECT p.proname::text || '(' || pg_get_function_identity_arguments(p.oid) || ')',
           pg_get_functiondef(p.oid)
    FROM pg_proc p
    JOIN pg_namespace n ON n.oid = p.pronamespace
    JOIN pg_language l ON l.oid = p.prolang
    WHERE n.nspname = $1
      AND p.prokind = 'f'
      AND l.lanname NOT IN ('c', 'internal')
      AND NOT EXISTS (
          SELECT 1 FROM pg_depend d
          WHERE d.classid = 'pg_proc'::regclass AND d.objid = p.oid AND d.deptype = 'e'
      )
    ORDER BY 1
"#;

const INDEXES_QUERY: &str = r#"
    SELECT i.indexname::text,
           i.tablename::text,
           i.indexdef,
           EXISTS (
               SELECT 1
               FROM pg_constraint con
               WHERE con.conindid = format('%I.%I', i.schemaname, i.indexname)::regclass
                 AND con.contype IN ('p', 'u', 'x')
           )
    FROM pg_indexes i
    WHERE i.schemaname = $1
    ORDER BY i.indexname
"#;

const SEQUENCES_QUERY: &str = r#"
    SELECT s.sequencename::text,
           s.data_type::text,
           s.start_value,
           s.min_value,
           s.max_value,
           s.increment_by,
           s.cache_size,
           s.cycle,
           s.last_value
    FROM pg_sequences s
    WHERE s.schemaname = $1
      AND NOT EXISTS (
          SELECT 1
          FROM pg_depend d
          JOIN pg_class c ON c.oid = d.objid
          JOIN pg_namespace n ON n.oid = c.relnamespace
          WHERE c.relname = s.sequencename
            AND n.nspname = s.schemaname
            AND d.deptype = 'i'
      )
    ORDER BY s.sequencename
"#;

const EXTENSIONS_QUERY: &str = r#"
    SELECT extname::text, extversion
    FROM pg_extension
    WHERE extname <> 'plpgsql'
    ORDER BY extname
"#;

/// Reads one schema's catalog into a [`SchemaSnapshot`].
#[derive(Debug, Clone)]
pub struct Introspector {
    schema: String,
    exclude_tables: Vec<String>,
    exclude_indexes: Vec<String>,
}

impl Introspector {
    pub fn new(sync: &SyncConfig) -> Self {
        Self {
            schema: sync.schema.clone(),
            exclude_tables: sync.exclude_tables.clone(),
            exclude_indexes: sync.exclude_indexes.clone(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Take a full snapshot of the configured schema.
    pub async fn snapshot(&self, client: &mut Client, label: &str) -> Result<SchemaSnapshot> {
        let mut tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        let mut snapshot = SchemaSnapshot::new(&self.schema);
        snapshot.enums = self.load_enums(&mut tx).await?;
        snapshot.tables = self.load_tables(&tx).await?;
        for fk in self.load_foreign_keys(&tx, &snapshot.tables).await? {
            snapshot.add_foreign_key(fk);
        }
        attach_column_references(&mut snapshot.tables, snapshot.foreign_keys.values());
        snapshot.views = self.load_views(&tx).await?;
        snapshot.functions = self.load_functions(&tx).await?;
        let (indexes, pkey_indexes) = self.load_indexes(&tx).await?;
        snapshot.indexes = indexes;
        snapshot.pkey_indexes = pkey_indexes;
        snapshot.sequences = self.load_sequences(&tx).await?;
        snapshot.extensions = self.load_extensions(&tx).await?;

        tx.commit().await?;

        info!(
            "{}: {} tables, {} enums, {} views, {} functions, {} indexes, {} sequences, {} foreign keys",
            label,
            snapshot.tables.len(),
            snapshot.enums.len(),
            snapshot.views.len(),
            snapshot.functions.len(),
            snapshot.indexes.len(),
            snapshot.sequences.len(),
            snapshot.foreign_keys.len()
        );
        Ok(snapshot)
    }

    /// Enum types. A failure reading one type's values is logged and the
    /// values treated as empty; only that savepoint is rolled back.
    async fn load_enums(&self, tx: &mut Transaction<'_>) -> Result<BTreeMap<String, EnumType>> {
        let rows = tx.query(ENUMS_QUERY, &[&self.schema]).await?;
        let mut enums = BTreeMap::new();

        for row in rows {
            let name: String = row.get(0);
            let ddl: String = row.get(1);

            let values_sql = format!(
                "SELECT unnest(enum_range(NULL::{}))::text",
                qualify(&self.schema, &name)
            );
            let savepoint = tx.savepoint("enum_values").await?;
            let values = match savepoint.query(values_sql.as_str(), &[]).await {
                Ok(value_rows) => {
                    savepoint.commit().await?;
                    value_rows.iter().map(|r| r.get::<_, String>(0)).collect()
                }
                Err(e) => {
                    warn!("Could not read values of enum {}: {}", name, e);
                    savepoint.rollback().await?;
                    Vec::new()
                }
            };

            enums.insert(name.clone(), enum_type(name, values, ddl));
        }

        Ok(enums)
    }

    async fn load_tables(&self, tx: &Transaction<'_>) -> Result<BTreeMap<String, Table>> {
        let mut tables: BTreeMap<String, Table> = tx
            .query(TABLES_QUERY, &[&self.schema, &self.exclude_tables])
            .await?
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                (name.clone(), Table::new(name, Vec::new()))
            })
            .collect();

        for row in tx.query(COLUMNS_QUERY, &[&self.schema]).await? {
            let table_name: String = row.get(0);
            let Some(table) = tables.get_mut(&table_name) else {
                continue;
            };
            let default: Option<String> = row.get(5);
            let catalog_identity: bool = row.get(6);
            let is_identity = catalog_identity
                || default.as_deref().is_some_and(|d| d.contains("nextval("));
            table.columns.push(Column {
                name: row.get(1),
                data_type: row.get(2),
                udt_name: row.get(3),
                nullable: row.get(4),
                default,
                is_identity,
                generated_always: row.get(7),
                is_primary_key: false,
                is_unique: false,
                references: None,
            });
        }

        let key_rows = tx
            .query(KEY_CONSTRAINTS_QUERY, &[&self.schema])
            .await?
            .iter()
            .map(|row| KeyConstraintRow {
                table: row.get(0),
                name: row.get(1),
                contype: row.get(2),
                columns: row.get(3),
            })
            .collect::<Vec<_>>();
        apply_key_constraints(&mut tables, key_rows);

        debug!("Loaded {} tables from schema {}", tables.len(), self.schema);
        Ok(tables)
    }

    async fn load_foreign_keys(
        &self,
        tx: &Transaction<'_>,
        tables: &BTreeMap<String, Table>,
    ) -> Result<Vec<ForeignKey>> {
        let rows = tx.query(FOREIGN_KEYS_QUERY, &[&self.schema]).await?;
        let mut fks = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.get(1);
            if !tables.contains_key(&table) {
                continue;
            }
            let on_delete: String = row.get(5);
            let on_update: String = row.get(6);
            fks.push(ForeignKey {
                name: row.get(0),
                table,
                columns: row.get(2),
                ref_table: row.get(3),
                ref_columns: row.get(4),
                on_delete: ReferentialAction::from_pg_code(&on_delete),
                on_update: ReferentialAction::from_pg_code(&on_update),
                definition: row.get(7),
            });
        }
        Ok(fks)
    }

    async fn load_views(&self, tx: &Transaction<'_>) -> Result<BTreeMap<String, String>> {
        let mut views = BTreeMap::new();
        for row in tx.query(VIEWS_QUERY, &[&self.schema]).await? {
            let name: String = row.get(0);
            let definition: Option<String> = row.get(1);
            let Some(definition) = definition else {
                return Err(MigrateError::Introspection(format!(
                    "no definition returned for view {}",
                    name
                )));
            };
            let ddl = format!(
                "CREATE OR REPLACE VIEW {} AS\n{}",
                qualify(&self.schema, &name),
                terminate(definition.trim())
            );
            views.insert(name, ddl);
        }
        Ok(views)
    }

    async fn load_functions(&self, tx: &Transaction<'_>) -> Result<BTreeMap<String, String>> {
        Ok(tx
            .query(FUNCTIONS_QUERY, &[&self.schema])
            .await?
            .iter()
            .map(|row| {
                let signature: String = row.get(0);
                let ddl: String = row.get(1);
                (signature, terminate(ddl.trim()))
            })
            .collect())
    }

    async fn load_indexes(
        &self,
        tx: &Transaction<'_>,
    ) -> Result<(BTreeMap<String, Index>, BTreeMap<String, Index>)> {
        let rows = tx.query(INDEXES_QUERY, &[&self.schema]).await?;
        Ok(partition_indexes(
            rows.iter().map(|row| IndexRow {
                name: row.get(0),
                table: row.get(1),
                def: row.get(2),
                constraint_backed: row.get(3),
            }),
            &self.exclude_tables,
            &self.exclude_indexes,
        ))
    }

    async fn load_sequences(&self, tx: &Transaction<'_>) -> Result<BTreeMap<String, Sequence>> {
        let mut sequences = BTreeMap::new();
        for row in tx.query(SEQUENCES_QUERY, &[&self.schema]).await? {
            let start_value: i64 = row.get(2);
            let last_value: Option<i64> = row.get(8);
            let seq = Sequence {
                name: row.get(0),
                data_type: row.get(1),
                start_value,
                min_value: row.get(3),
                max_value: row.get(4),
                increment_by: row.get(5),
                cache_size: row.get(6),
                cycle: row.get(7),
                // Never-called sequences report NULL
                last_value: last_value.unwrap_or(start_value),
                is_called: last_value.is_some(),
            };
            sequences.insert(seq.name.clone(), seq);
        }
        Ok(sequences)
    }

    async fn load_extensions(&self, tx: &Transaction<'_>) -> Result<BTreeMap<String, String>> {
        Ok(tx
            .query(EXTENSIONS_QUERY, &[])
            .await?
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }
}

/// Build an enum descriptor with its values sorted for comparison.
fn enum_type(name: String, mut values: Vec<String>, ddl: String) -> EnumType {
    values.sort();
    EnumType { name, values, ddl }
}

/// Append `;` unless the statement already ends with one.
fn terminate(sql: &str) -> String {
    if sql.ends_with(';') {
        sql.to_string()
    } else {
        format!("{};", sql)
    }
}

struct KeyConstraintRow {
    table: String,
    name: String,
    contype: String,
    columns: Vec<String>,
}

/// Single-column keys become column flags; multi-column keys are kept as
/// composite constraints in catalog order.
fn apply_key_constraints(tables: &mut BTreeMap<String, Table>, rows: Vec<KeyConstraintRow>) {
    for row in rows {
        let Some(table) = tables.get_mut(&row.table) else {
            continue;
        };
        let kind = if row.contype == "p" {
            ConstraintKind::PrimaryKey
        } else {
            ConstraintKind::Unique
        };

        if let [single] = row.columns.as_slice() {
            if let Some(col) = table.columns.iter_mut().find(|c| &c.name == single) {
                match kind {
                    ConstraintKind::PrimaryKey => col.is_primary_key = true,
                    ConstraintKind::Unique => col.is_unique = true,
                }
            }
        } else {
            table.composite_constraints.push(CompositeConstraint {
                name: row.name,
                kind,
                columns: row.columns,
            });
        }
    }
}

/// Copy single-column foreign keys onto their columns.
fn attach_column_references<'a>(
    tables: &mut BTreeMap<String, Table>,
    fks: impl Iterator<Item = &'a ForeignKey>,
) {
    for fk in fks {
        let ([col], [ref_col]) = (fk.columns.as_slice(), fk.ref_columns.as_slice()) else {
            continue;
        };
        let Some(column) = tables
            .get_mut(&fk.table)
            .and_then(|t| t.columns.iter_mut().find(|c| &c.name == col))
        else {
            continue;
        };
        column.references = Some(ColumnReference {
            table: fk.ref_table.clone(),
            column: ref_col.clone(),
            on_delete: fk.on_delete,
            on_update: fk.on_update,
        });
    }
}

struct IndexRow {
    name: String,
    table: String,
    def: String,
    /// Owned by a PRIMARY KEY, UNIQUE or EXCLUDE constraint.
    constraint_backed: bool,
}

/// Split index rows into secondary and `_pkey` indexes, dropping
/// denylisted indexes and indexes of excluded tables.
///
/// Other constraint-owned indexes are left out: `CREATE TABLE` recreates
/// them with their constraint and they cannot be dropped on their own.
fn partition_indexes(
    rows: impl Iterator<Item = IndexRow>,
    exclude_tables: &[String],
    exclude_indexes: &[String],
) -> (BTreeMap<String, Index>, BTreeMap<String, Index>) {
    let mut indexes = BTreeMap::new();
    let mut pkeys = BTreeMap::new();
    for row in rows {
        if exclude_indexes.contains(&row.name) || exclude_tables.contains(&row.table) {
            continue;
        }
        let is_pkey = row.name.ends_with("_pkey");
        if row.constraint_backed && !is_pkey {
            continue;
        }
        let index = Index {
            name: row.name.clone(),
            table: row.table,
            ddl: terminate(row.def.trim()),
        };
        if is_pkey {
            pkeys.insert(row.name, index);
        } else {
            indexes.insert(row.name, index);
        }
    }
    (indexes, pkeys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_table() -> Table {
        Table::new(
            "orders",
            vec![
                Column::new("id", "integer").not_null(),
                Column::new("tenant_id", "integer").not_null(),
                Column::new("number", "text").not_null(),
                Column::new("user_id", "integer"),
            ],
        )
    }

    #[test]
    fn test_enum_values_sorted_ddl_untouched() {
        let e = enum_type(
            "order_status".into(),
            vec!["pending".into(), "cancelled".into(), "delivered".into()],
            "CREATE TYPE public.order_status AS ENUM ('pending', 'cancelled', 'delivered');".into(),
        );
        assert_eq!(e.values, vec!["cancelled", "delivered", "pending"]);
        assert!(e.ddl.contains("('pending', 'cancelled', 'delivered')"));
    }

    #[test]
    fn test_single_column_keys_become_flags() {
        let mut tables = BTreeMap::new();
        tables.insert("orders".to_string(), orders_table());
        apply_key_constraints(
            &mut tables,
            vec![
                KeyConstraintRow {
                    table: "orders".into(),
                    name: "orders_pkey".into(),
                    contype: "p".into(),
                    columns: vec!["id".into()],
                },
                KeyConstraintRow {
                    table: "orders".into(),
                    name: "orders_number_key".into(),
                    contype: "u".into(),
                    columns: vec!["number".into()],
                },
            ],
        );
        let orders = &tables["orders"];
        assert!(orders.column("id").unwrap().is_primary_key);
        assert!(orders.column("number").unwrap().is_unique);
        assert!(orders.composite_constraints.is_empty());
    }

    #[test]
    fn test_composite_keys_keep_column_order() {
        let mut tables = BTreeMap::new();
        tables.insert("orders".to_string(), orders_table());
        apply_key_constraints(
            &mut tables,
            vec![KeyConstraintRow {
                table: "orders".into(),
                name: "orders_tenant_number_key".into(),
                contype: "u".into(),
                columns: vec!["tenant_id".into(), "number".into()],
            }],
        );
        let composite = &tables["orders"].composite_constraints;
        assert_eq!(composite.len(), 1);
        assert_eq!(composite[0].kind, ConstraintKind::Unique);
        assert_eq!(composite[0].columns, vec!["tenant_id", "number"]);
        assert!(!tables["orders"].column("number").unwrap().is_unique);
    }

    #[test]
    fn test_constraints_on_unknown_tables_ignored() {
        let mut tables = BTreeMap::new();
        apply_key_constraints(
            &mut tables,
            vec![KeyConstraintRow {
                table: "databasechangelog".into(),
                name: "pk".into(),
                contype: "p".into(),
                columns: vec!["id".into()],
            }],
        );
        assert!(tables.is_empty());
    }

    #[test]
    fn test_single_column_fk_attached_to_column() {
        let mut tables = BTreeMap::new();
        tables.insert("orders".to_string(), orders_table());
        let single = ForeignKey::new(
            "orders_user_fk",
            "orders",
            vec!["user_id".into()],
            "users",
            vec!["id".into()],
            ReferentialAction::SetNull,
            ReferentialAction::NoAction,
        );
        let composite = ForeignKey::new(
            "orders_tenant_fk",
            "orders",
            vec!["tenant_id".into(), "number".into()],
            "tenants",
            vec!["id".into(), "code".into()],
            ReferentialAction::NoAction,
            ReferentialAction::NoAction,
        );
        attach_column_references(&mut tables, [single, composite].iter());

        let orders = &tables["orders"];
        let reference = orders.column("user_id").unwrap().references.as_ref().unwrap();
        assert_eq!(reference.table, "users");
        assert_eq!(reference.on_delete, ReferentialAction::SetNull);
        assert!(orders.column("tenant_id").unwrap().references.is_none());
    }

    fn index_row(name: &str, table: &str, def: &str, constraint_backed: bool) -> IndexRow {
        IndexRow {
            name: name.into(),
            table: table.into(),
            def: def.into(),
            constraint_backed,
        }
    }

    #[test]
    fn test_partition_indexes() {
        let rows = vec![
            index_row(
                "orders_pkey",
                "orders",
                "CREATE UNIQUE INDEX orders_pkey ON public.orders USING btree (id)",
                true,
            ),
            index_row(
                "orders_created_idx",
                "orders",
                "CREATE INDEX orders_created_idx ON public.orders USING btree (created_at)",
                false,
            ),
            index_row("databasechangeloglock_pkey", "databasechangeloglock", "CREATE UNIQUE INDEX ...", true),
            index_row("changelog_idx", "databasechangelog", "CREATE INDEX ...", false),
        ];
        let (indexes, pkeys) = partition_indexes(
            rows.into_iter(),
            &["databasechangelog".to_string()],
            &["databasechangeloglock_pkey".to_string()],
        );
        assert_eq!(indexes.len(), 1);
        assert!(indexes["orders_created_idx"].ddl.ends_with("(created_at);"));
        assert_eq!(indexes["orders_created_idx"].table, "orders");
        assert_eq!(pkeys.keys().collect::<Vec<_>>(), vec!["orders_pkey"]);
    }

    #[test]
    fn test_unique_constraint_indexes_left_to_table_ddl() {
        let rows = vec![
            index_row(
                "t2_code_key",
                "t2",
                "CREATE UNIQUE INDEX t2_code_key ON public.t2 USING btree (code)",
                true,
            ),
            index_row(
                "t2_code_lower_idx",
                "t2",
                "CREATE UNIQUE INDEX t2_code_lower_idx ON public.t2 USING btree (lower(code))",
                false,
            ),
        ];
        let (indexes, pkeys) = partition_indexes(rows.into_iter(), &[], &[]);
        assert_eq!(indexes.keys().collect::<Vec<_>>(), vec!["t2_code_lower_idx"]);
        assert!(pkeys.is_empty());
    }

    #[test]
    fn test_terminate() {
        assert_eq!(terminate("SELECT 1"), "SELECT 1;");
        assert_eq!(terminate("SELECT 1;"), "SELECT 1;");
    }
}
