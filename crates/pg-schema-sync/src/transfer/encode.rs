//! Per-table copy: column encoding, streaming read, batched idempotent insert.

use futures::{pin_mut, TryStreamExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};
use tracing::debug;
use uuid::Uuid;

use crate::core::identifier::{qualify_table, quote_ident, quote_list};
use crate::core::{Column, SqlValue, Table};
use crate::error::{MigrateError, Result};

/// How a column is fetched from the source and rendered for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Uuid,
    /// json/jsonb, fetched as text so key order and number precision survive.
    Json,
    Bytea,
    /// One-dimensional array, fetched as `text[]`.
    Array,
    /// Anything else, fetched as its text form.
    Text,
}

impl ColumnKind {
    /// Pick the kind from the column's underlying type name.
    pub fn from_udt(udt_name: &str) -> Self {
        if udt_name.starts_with('_') {
            return ColumnKind::Array;
        }
        match udt_name {
            "bool" => ColumnKind::Bool,
            "int2" | "int4" | "int8" => ColumnKind::Int,
            "uuid" => ColumnKind::Uuid,
            "json" | "jsonb" => ColumnKind::Json,
            "bytea" => ColumnKind::Bytea,
            _ => ColumnKind::Text,
        }
    }

    /// Select-list expression for a quoted column name.
    fn select_expr(&self, quoted: &str) -> String {
        match self {
            ColumnKind::Int => format!("{}::int8", quoted),
            ColumnKind::Array => format!("{}::text[]", quoted),
            ColumnKind::Json | ColumnKind::Text => format!("{}::text", quoted),
            _ => quoted.to_string(),
        }
    }

    fn decode(&self, row: &Row, idx: usize) -> std::result::Result<SqlValue, tokio_postgres::Error> {
        let value = match self {
            ColumnKind::Bool => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
            ColumnKind::Int => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int),
            ColumnKind::Uuid => row.try_get::<_, Option<Uuid>>(idx)?.map(SqlValue::Uuid),
            ColumnKind::Bytea => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
            ColumnKind::Array => row
                .try_get::<_, Option<Vec<Option<String>>>>(idx)?
                .map(SqlValue::Array),
            ColumnKind::Json | ColumnKind::Text => {
                row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
            }
        };
        Ok(value.unwrap_or(SqlValue::Null))
    }
}

/// Statements and decoders for copying one table.
#[derive(Debug, Clone)]
pub struct TableCopyPlan {
    pub table: String,
    pub columns: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    pub select_sql: String,
    insert_prefix: String,
    conflict_clause: String,
}

impl TableCopyPlan {
    /// Copy the columns present on both sides, in source order.
    ///
    /// The conflict target is the target table's primary key. Inserting
    /// into a `GENERATED ALWAYS` identity column needs `OVERRIDING SYSTEM
    /// VALUE`.
    pub fn new(schema: &str, source: &Table, target: &Table) -> Result<Self> {
        let common: Vec<&Column> = source
            .columns
            .iter()
            .filter(|c| target.column(&c.name).is_some())
            .collect();
        if common.is_empty() {
            return Err(MigrateError::transfer(
                &source.name,
                "no columns in common between source and target",
            ));
        }

        let columns: Vec<String> = common.iter().map(|c| c.name.clone()).collect();
        let kinds: Vec<ColumnKind> = common.iter().map(|c| ColumnKind::from_udt(&c.udt_name)).collect();
        let qualified = qualify_table(schema, &source.name);

        let select_list = columns
            .iter()
            .zip(&kinds)
            .map(|(c, k)| k.select_expr(&quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let pk = target.primary_key();
        let conflict_clause = if pk.is_empty() {
            "ON CONFLICT DO NOTHING".to_string()
        } else {
            format!("ON CONFLICT ({}) DO NOTHING", quote_list(&pk))
        };

        let overriding = if columns
            .iter()
            .filter_map(|c| target.column(c))
            .any(|c| c.generated_always)
        {
            " OVERRIDING SYSTEM VALUE"
        } else {
            ""
        };

        Ok(Self {
            table: source.name.clone(),
            select_sql: format!("SELECT {} FROM {}", select_list, qualified),
            insert_prefix: format!(
                "INSERT INTO {} ({}){} VALUES ",
                qualified,
                quote_list(&columns),
                overriding
            ),
            columns,
            kinds,
            conflict_clause,
        })
    }

    /// Multi-row INSERT for `rows`.
    pub fn insert_sql(&self, rows: &[Vec<SqlValue>]) -> String {
        let values = rows
            .iter()
            .map(|row| {
                let literals = row.iter().map(SqlValue::to_literal).collect::<Vec<_>>();
                format!("({})", literals.join(", "))
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!("{}{} {}", self.insert_prefix, values, self.conflict_clause)
    }

    fn decode_row(&self, row: &Row) -> Result<Vec<SqlValue>> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, k)| {
                k.decode(row, i).map_err(|e| {
                    MigrateError::transfer(&self.table, format!("column {}: {}", self.columns[i], e))
                })
            })
            .collect()
    }
}

fn slice_iter<'a>(
    s: &'a [&'a (dyn ToSql + Sync)],
) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    s.iter().map(|s| *s as _)
}

/// Stream every source row into the target inside one target transaction.
///
/// Any error drops the transaction, rolling back everything this attempt
/// inserted.
pub async fn copy_table(
    source: &Client,
    target: &mut Client,
    plan: &TableCopyPlan,
    batch_rows: usize,
) -> Result<u64> {
    let rows = source.query_raw(plan.select_sql.as_str(), slice_iter(&[])).await?;
    pin_mut!(rows);

    let tx = target.transaction().await?;
    let mut batch = Vec::with_capacity(batch_rows);
    let mut written = 0u64;

    while let Some(row) = rows.try_next().await? {
        batch.push(plan.decode_row(&row)?);
        if batch.len() >= batch_rows {
            tx.batch_execute(&plan.insert_sql(&batch)).await?;
            written += batch.len() as u64;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        tx.batch_execute(&plan.insert_sql(&batch)).await?;
        written += batch.len() as u64;
    }

    tx.commit().await?;
    debug!(table = %plan.table, rows = written, "Committed {} rows into {}", written, plan.table);
    Ok(written)
}
