//! Foreign key statements.

use crate::core::identifier::{qualify_table, quote_ident};
use crate::core::ForeignKey;

/// `ALTER TABLE schema."t" ADD CONSTRAINT "fk" <definition>[ NOT VALID];`
///
/// The definition is taken from the descriptor as-is, minus any existing
/// `NOT VALID` marker.
pub fn add_constraint_sql(schema: &str, fk: &ForeignKey, not_valid: bool) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}{};",
        qualify_table(schema, &fk.table),
        quote_ident(&fk.name),
        fk.bare_definition(),
        if not_valid { " NOT VALID" } else { "" }
    )
}

/// `ALTER TABLE schema."t" DROP CONSTRAINT IF EXISTS "fk";`
pub fn drop_constraint_sql(schema: &str, fk: &ForeignKey) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
        qualify_table(schema, &fk.table),
        quote_ident(&fk.name)
    )
}

/// `ALTER TABLE schema."t" VALIDATE CONSTRAINT "fk";`
pub fn validate_constraint_sql(schema: &str, fk: &ForeignKey) -> String {
    format!(
        "ALTER TABLE {} VALIDATE CONSTRAINT {};",
        qualify_table(schema, &fk.table),
        quote_ident(&fk.name)
    )
}

/// Derive `VALIDATE CONSTRAINT` statements from generated
/// `ADD CONSTRAINT ... NOT VALID` statements.
///
/// Statements without `NOT VALID` or that do not parse are skipped.
pub fn validate_statements_from<'a>(statements: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    statements
        .into_iter()
        .filter_map(|stmt| {
            let stmt = stmt.trim();
            if !stmt.trim_end_matches(';').trim_end().ends_with("NOT VALID") {
                return None;
            }
            let rest = stmt.strip_prefix("ALTER TABLE ")?;
            let split = rest.find(" ADD CONSTRAINT ")?;
            let table = &rest[..split];
            let name = leading_identifier(&rest[split + " ADD CONSTRAINT ".len()..])?;
            Some(format!("ALTER TABLE {} VALIDATE CONSTRAINT {};", table, name))
        })
        .collect()
}

/// First identifier token of `s`, quoted or bare, returned as written.
fn leading_identifier(s: &str) -> Option<&str> {
    if let Some(body) = s.strip_prefix('"') {
        let bytes = body.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'"' {
                if bytes.get(i + 1) == Some(&b'"') {
                    i += 2;
                    continue;
                }
                return Some(&s[..i + 2]);
            }
            i += 1;
        }
        None
    } else {
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        (end > 0).then(|| &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReferentialAction;

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

    #[test]
    fn test_add_constraint_sql() {
        assert_eq!(
            add_constraint_sql("public", &orders_fk(), false),
            "ALTER TABLE public.\"orders\" ADD CONSTRAINT \"orders_user_id_fkey\" \
             FOREIGN KEY (\"user_id\") REFERENCES \"users\"(\"id\") ON DELETE CASCADE;"
        );
        assert!(add_constraint_sql("public", &orders_fk(), true).ends_with(" ON DELETE CASCADE NOT VALID;"));
    }

    #[test]
    fn test_existing_not_valid_not_duplicated() {
        let mut fk = orders_fk();
        fk.definition.push_str(" NOT VALID");
        let sql = add_constraint_sql("public", &fk, true);
        assert_eq!(sql.matches("NOT VALID").count(), 1);
        let sql = add_constraint_sql("public", &fk, false);
        assert!(!sql.contains("NOT VALID"));
    }

    #[test]
    fn test_validate_extracted_from_add_statements() {
        let adds = vec![
            add_constraint_sql("public", &orders_fk(), true),
            "ALTER TABLE public.\"we\"\"ird\" ADD CONSTRAINT \"fk \"\"x\"\"\" FOREIGN KEY (a) REFERENCES b(id) NOT VALID;".to_string(),
            add_constraint_sql("public", &orders_fk(), false),
            "-- not a statement NOT VALID;".to_string(),
        ];
        let validates = validate_statements_from(adds.iter().map(String::as_str));
        assert_eq!(
            validates,
            vec![
                "ALTER TABLE public.\"orders\" VALIDATE CONSTRAINT \"orders_user_id_fkey\";".to_string(),
                "ALTER TABLE public.\"we\"\"ird\" VALIDATE CONSTRAINT \"fk \"\"x\"\"\";".to_string(),
            ]
        );
    }

    #[test]
    fn test_validate_matches_direct_rendering() {
        let add = add_constraint_sql("public", &orders_fk(), true);
        let extracted = validate_statements_from([add.as_str()]);
        assert_eq!(extracted, vec![validate_constraint_sql("public", &orders_fk())]);
    }

    #[test]
    fn test_drop_constraint_sql() {
        assert_eq!(
            drop_constraint_sql("public", &orders_fk()),
            "ALTER TABLE public.\"orders\" DROP CONSTRAINT IF EXISTS \"orders_user_id_fkey\";"
        );
    }

    #[test]
    fn test_leading_identifier() {
        assert_eq!(leading_identifier("plain FOREIGN KEY"), Some("plain"));
        assert_eq!(leading_identifier("\"a\"\"b\" rest"), Some("\"a\"\"b\""));
        assert_eq!(leading_identifier("\"unterminated"), None);
    }
}
