//! Sequence reconciliation after a data load.
//!
//! Identity-backed sequences are advanced to the loaded data maximum when
//! they trail it and never rewound. Standalone sequences take the source
//! position whenever the two sides differ.

use serde::Serialize;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::core::identifier::{qualify, qualify_table, quote_ident};
use crate::core::{Sequence, Table};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    /// Identity sequence moved up to the column maximum.
    Advanced,
    /// Standalone sequence set to the source position.
    Copied,
}

/// A sequence that was moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceAdjustment {
    pub sequence: String,
    /// `table.column` for identity sequences.
    pub column: Option<String>,
    pub kind: AdjustmentKind,
    /// Last value handed out before the adjustment.
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequenceReport {
    pub adjustments: Vec<SequenceAdjustment>,
    pub errors: Vec<String>,
}

/// Value to `setval(.., v, true)` an identity sequence to, if it trails the
/// data.
///
/// A sequence that has never been called has handed out nothing, so its
/// effective position is one below `last_value`.
pub fn identity_advance(last_value: i64, is_called: bool, max_value: Option<i64>) -> Option<i64> {
    let max = max_value?;
    let effective = if is_called { last_value } else { last_value - 1 };
    (effective < max).then_some(max)
}

async fn sequence_position(client: &Client, sequence: &str) -> Result<(i64, bool)> {
    let row = client
        .query_one(&format!("SELECT last_value, is_called FROM {}", sequence), &[])
        .await?;
    Ok((row.get(0), row.get(1)))
}

async fn set_sequence(client: &Client, sequence: &str, value: i64, is_called: bool) -> Result<()> {
    client
        .execute(
            "SELECT setval($1::text::regclass, $2, $3)",
            &[&sequence, &value, &is_called],
        )
        .await?;
    Ok(())
}

/// Advance every identity sequence of `tables` on the target that trails
/// its column maximum.
pub async fn reconcile_identity_sequences(
    target: &Client,
    schema: &str,
    tables: &[&Table],
) -> SequenceReport {
    let mut report = SequenceReport::default();
    for table in tables {
        for column in table.identity_columns() {
            let label = format!("{}.{}", table.name, column.name);
            match advance_identity(target, schema, table, &column.name).await {
                Ok(Some(adj)) => {
                    info!(column = %label, "Advanced {} from {} to {}", adj.sequence, adj.from, adj.to);
                    report.adjustments.push(SequenceAdjustment {
                        column: Some(label),
                        ..adj
                    });
                }
                Ok(None) => debug!(column = %label, "Sequence for {} already ahead of data", label),
                Err(e) => {
                    warn!(column = %label, "Could not reconcile sequence for {}: {}", label, e);
                    report.errors.push(format!("{}: {}", label, e));
                }
            }
        }
    }
    report
}

async fn advance_identity(
    client: &Client,
    schema: &str,
    table: &Table,
    column: &str,
) -> Result<Option<SequenceAdjustment>> {
    let qualified = qualify_table(schema, &table.name);
    let row = client
        .query_one(
            "SELECT pg_get_serial_sequence($1, $2)",
            &[&qualified, &column],
        )
        .await?;
    let Some(sequence) = row.get::<_, Option<String>>(0) else {
        return Ok(None);
    };

    let (last_value, is_called) = sequence_position(client, &sequence).await?;
    let max: Option<i64> = client
        .query_one(
            &format!("SELECT MAX({})::bigint FROM {}", quote_ident(column), qualified),
            &[],
        )
        .await?
        .get(0);

    let Some(to) = identity_advance(last_value, is_called, max) else {
        return Ok(None);
    };
    set_sequence(client, &sequence, to, true).await?;
    Ok(Some(SequenceAdjustment {
        sequence,
        column: None,
        kind: AdjustmentKind::Advanced,
        from: last_value,
        to,
    }))
}

/// Copy the source position of every standalone sequence onto the target
/// where they differ.
pub async fn copy_sequences<'a>(
    source: &Client,
    target: &Client,
    schema: &str,
    sequences: impl IntoIterator<Item = &'a Sequence>,
) -> SequenceReport {
    let mut report = SequenceReport::default();
    for seq in sequences {
        let name = qualify(schema, &seq.name);
        match copy_one(source, target, &name).await {
            Ok(Some(adj)) => {
                info!("Copied sequence {} position {} -> {}", name, adj.from, adj.to);
                report.adjustments.push(adj);
            }
            Ok(None) => debug!("Sequence {} already matches source", name),
            Err(e) => {
                warn!("Could not copy sequence {}: {}", name, e);
                report.errors.push(format!("{}: {}", name, e));
            }
        }
    }
    report
}

async fn copy_one(source: &Client, target: &Client, name: &str) -> Result<Option<SequenceAdjustment>> {
    let (src_last, src_called) = sequence_position(source, name).await?;
    let (tgt_last, tgt_called) = sequence_position(target, name).await?;
    if (src_last, src_called) == (tgt_last, tgt_called) {
        return Ok(None);
    }
    set_sequence(target, name, src_last, src_called).await?;
    Ok(Some(SequenceAdjustment {
        sequence: name.to_string(),
        column: None,
        kind: AdjustmentKind::Copied,
        from: tgt_last,
        to: src_last,
    }))
}

impl SequenceReport {
    pub fn merge(&mut self, other: SequenceReport) {
        self.adjustments.extend(other.adjustments);
        self.errors.extend(other.errors);
    }
}
