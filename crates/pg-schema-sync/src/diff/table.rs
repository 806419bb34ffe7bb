//! Table comparison and `CREATE TABLE` rendering.

use std::collections::BTreeSet;

use crate::core::identifier::{qualify, qualify_table, quote_ident, quote_ident_min, quote_list};
use crate::core::{Column, Table};

/// Outcome of comparing one table present on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableChange {
    Unchanged,
    /// In-place `ALTER TABLE` statements, warning comments included.
    Alter(Vec<String>),
    /// `DROP TABLE ... CASCADE` followed by a full `CREATE TABLE`.
    Recreate,
}

/// Compare `source` against `target`.
///
/// Columns are compared by name, canonical type and nullability in ordinal
/// order, plus composite constraints. Default expressions are not compared.
/// Without `use_alter` any difference recreates the table.
pub fn compare_tables(schema: &str, source: &Table, target: &Table, use_alter: bool) -> TableChange {
    if same_shape(source, target) {
        return TableChange::Unchanged;
    }
    if !use_alter {
        return TableChange::Recreate;
    }

    let common: Vec<(&Column, &Column)> = source
        .columns
        .iter()
        .filter_map(|s| target.column(&s.name).map(|t| (s, t)))
        .collect();
    let added: Vec<&Column> = source
        .columns
        .iter()
        .filter(|s| target.column(&s.name).is_none())
        .collect();
    let dropped: Vec<&Column> = target
        .columns
        .iter()
        .filter(|t| source.column(&t.name).is_none())
        .collect();

    if common.is_empty() && (!added.is_empty() || !dropped.is_empty()) {
        return TableChange::Recreate;
    }
    if !same_composites(source, target) {
        return TableChange::Recreate;
    }

    let table = qualify(schema, &source.name);
    let mut statements = Vec::new();

    for (src, tgt) in &common {
        if canonical_type(&src.data_type) != canonical_type(&tgt.data_type) {
            if !is_safe_type_change(&tgt.data_type, &src.data_type) {
                return TableChange::Recreate;
            }
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {};",
                table,
                quote_ident(&src.name),
                src.data_type
            ));
        }
    }

    for (src, tgt) in &common {
        if src.nullable == tgt.nullable {
            continue;
        }
        if src.nullable {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL;",
                table,
                quote_ident(&src.name)
            ));
        } else {
            statements.push(format!(
                "-- WARNING: Setting NOT NULL on column {} may fail if existing data contains NULLs.",
                src.name
            ));
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL;",
                table,
                quote_ident(&src.name)
            ));
        }
    }

    for col in &added {
        statements.push(format!(
            "ALTER TABLE {} ADD COLUMN {};",
            table,
            column_definition(col, false)
        ));
    }

    for col in &dropped {
        statements.push(format!(
            "-- WARNING: Dropping column {} may cause data loss.",
            col.name
        ));
        statements.push(format!(
            "ALTER TABLE {} DROP COLUMN {};",
            table,
            quote_ident(&col.name)
        ));
    }

    if statements.is_empty() {
        // Only the column order differs.
        TableChange::Unchanged
    } else {
        TableChange::Alter(statements)
    }
}

fn same_shape(source: &Table, target: &Table) -> bool {
    source.columns.len() == target.columns.len()
        && source.columns.iter().zip(&target.columns).all(|(s, t)| {
            s.name == t.name
                && s.nullable == t.nullable
                && canonical_type(&s.data_type) == canonical_type(&t.data_type)
        })
        && same_composites(source, target)
}

/// Composite constraints match by kind and column list; names may differ.
fn same_composites(source: &Table, target: &Table) -> bool {
    let key = |t: &Table| {
        let mut keys: Vec<_> = t
            .composite_constraints
            .iter()
            .map(|c| (c.kind.as_sql(), c.columns.clone()))
            .collect();
        keys.sort();
        keys
    };
    key(source) == key(target)
}

/// Render the full `CREATE TABLE` statement from source metadata.
///
/// Single-column keys are inline; composite keys follow the columns. Foreign
/// keys are added separately.
pub fn create_table_sql(schema: &str, table: &Table) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("    {}", column_definition(c, true)))
        .collect();

    for constraint in &table.composite_constraints {
        lines.push(format!(
            "    CONSTRAINT {} {} ({})",
            quote_ident(&constraint.name),
            constraint.kind.as_sql(),
            quote_list(&constraint.columns)
        ));
    }

    format!(
        "CREATE TABLE {} (\n{}\n);",
        qualify_table(schema, &table.name),
        lines.join(",\n")
    )
}

/// `DROP TABLE ... CASCADE` followed by `CREATE TABLE`.
///
/// Sequences used by `nextval(...)` defaults on either side are detached
/// first so the cascade does not drop them with the table, then owned by
/// the new columns again.
pub fn recreate_table_sql(schema: &str, source: &Table, target: &Table) -> String {
    let detach: BTreeSet<String> = target
        .columns
        .iter()
        .chain(&source.columns)
        .filter_map(|c| default_sequence(schema, c))
        .collect();

    let mut lines: Vec<String> = detach
        .iter()
        .map(|seq| format!("ALTER SEQUENCE IF EXISTS {} OWNED BY NONE;", seq))
        .collect();
    lines.push(format!(
        "DROP TABLE IF EXISTS {} CASCADE;",
        qualify(schema, &source.name)
    ));
    lines.push(create_table_sql(schema, source));
    for col in &source.columns {
        if let Some(seq) = default_sequence(schema, col) {
            lines.push(format!(
                "ALTER SEQUENCE {} OWNED BY {}.{};",
                seq,
                qualify_table(schema, &source.name),
                quote_ident(&col.name)
            ));
        }
    }
    lines.join("\n")
}

/// Sequence named in a `nextval('...')` default, schema-qualified.
///
/// The literal is regclass text, so it is already quoted where needed and
/// only carries a schema when that schema is off the search path.
pub fn default_sequence(schema: &str, col: &Column) -> Option<String> {
    const NEXTVAL: &str = "nextval('";
    let default = col.default.as_deref()?;
    let start = default.find(NEXTVAL)? + NEXTVAL.len();

    let mut name = String::new();
    let mut chars = default[start..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                name.push('\'');
                continue;
            }
            break;
        }
        name.push(c);
    }
    if name.is_empty() {
        return None;
    }

    let mut quoted = false;
    let has_schema = name.chars().any(|c| {
        if c == '"' {
            quoted = !quoted;
        }
        c == '.' && !quoted
    });
    if has_schema {
        Some(name)
    } else {
        Some(format!("{}.{}", quote_ident_min(schema), name))
    }
}

/// `"name" type [DEFAULT ..] [NOT NULL] [PRIMARY KEY] [UNIQUE]`.
fn column_definition(col: &Column, inline_keys: bool) -> String {
    let mut def = format!("{} {}", quote_ident(&col.name), col.data_type);
    match &col.default {
        Some(default) => {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        None if col.generated_always => def.push_str(" GENERATED ALWAYS AS IDENTITY"),
        None if col.is_identity => def.push_str(" GENERATED BY DEFAULT AS IDENTITY"),
        None => {}
    }
    if !col.nullable {
        def.push_str(" NOT NULL");
    }
    if inline_keys {
        if col.is_primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if col.is_unique {
            def.push_str(" UNIQUE");
        }
    }
    def
}

/// Fold type spellings that mean the same thing.
pub fn canonical_type(data_type: &str) -> String {
    let t = data_type.trim().to_lowercase();
    let t = t.split_whitespace().collect::<Vec<_>>().join(" ");
    let (base, rest) = match t.find('(') {
        Some(pos) => (t[..pos].trim_end().to_string(), t[pos..].replace(", ", ",")),
        None => (t.clone(), String::new()),
    };
    let base = match base.as_str() {
        "int" | "int4" | "integer" => "integer",
        "int2" | "smallint" => "smallint",
        "int8" | "bigint" => "bigint",
        "varchar" | "character varying" => "character varying",
        "char" | "bpchar" | "character" => "character",
        "decimal" | "numeric" => "numeric",
        "bool" | "boolean" => "boolean",
        "float4" | "real" => "real",
        "float8" | "double precision" => "double precision",
        "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
        other => other,
    };
    format!("{}{}", base, rest)
}

fn integer_rank(t: &str) -> Option<u8> {
    match t {
        "smallint" => Some(1),
        "integer" => Some(2),
        "bigint" => Some(3),
        _ => None,
    }
}

fn is_numeric(t: &str) -> bool {
    integer_rank(t).is_some()
        || t == "real"
        || t == "double precision"
        || t == "numeric"
        || t.starts_with("numeric(")
}

/// `Some(None)` for unbounded varchar, `Some(Some(n))` for `varchar(n)`.
fn varchar_length(t: &str) -> Option<Option<u32>> {
    let rest = t.strip_prefix("character varying")?;
    if rest.is_empty() {
        return Some(None);
    }
    rest.strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .and_then(|n| n.parse().ok())
        .map(Some)
}

/// Whether `from` can be widened to `to` in place without data loss.
///
/// Allowed: varchar length increase, varchar to text, smallint to integer to
/// bigint, and any numeric type to text or varchar.
pub fn is_safe_type_change(from: &str, to: &str) -> bool {
    let from = canonical_type(from);
    let to = canonical_type(to);

    if let Some(from_len) = varchar_length(&from) {
        if to == "text" {
            return true;
        }
        if let Some(to_len) = varchar_length(&to) {
            return match (from_len, to_len) {
                (Some(a), Some(b)) => b > a,
                (_, None) => true,
                (None, Some(_)) => false,
            };
        }
        return false;
    }

    if let (Some(a), Some(b)) = (integer_rank(&from), integer_rank(&to)) {
        return b > a;
    }

    is_numeric(&from) && (to == "text" || varchar_length(&to).is_some())
}
