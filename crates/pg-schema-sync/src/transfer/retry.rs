//! Bounded retry rounds over a set of tables.
//!
//! Round `n` submits every table still pending; tables that fail are
//! collected and resubmitted in round `n + 1` until `max_attempts` rounds
//! have run. A table that fails its last attempt is permanently failed and
//! reported, never fatal to the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::core::TableLoader;
use crate::error::MigrateError;

/// Load state of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TableState {
    Pending,
    Attempting { attempt: u32 },
    Succeeded { attempts: u32, rows: u64 },
    RetryableFailed { attempt: u32, error: String },
    PermanentlyFailed { attempts: u32, error: String },
}

impl TableState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TableState::Succeeded { .. } | TableState::PermanentlyFailed { .. }
        )
    }
}

/// Attempt ceiling and concurrency.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub workers: usize,
}

/// Final state of every submitted table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryOutcome {
    pub states: BTreeMap<String, TableState>,
    pub rounds: u32,
}

impl RetryOutcome {
    /// Rows loaded per succeeded table.
    pub fn loaded(&self) -> BTreeMap<String, u64> {
        self.states
            .iter()
            .filter_map(|(t, s)| match s {
                TableState::Succeeded { rows, .. } => Some((t.clone(), *rows)),
                _ => None,
            })
            .collect()
    }

    /// Last error per permanently failed table.
    pub fn failed(&self) -> BTreeMap<String, String> {
        self.states
            .iter()
            .filter_map(|(t, s)| match s {
                TableState::PermanentlyFailed { error, .. } => Some((t.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Load `tables` with up to `policy.workers` concurrent tasks, retrying
/// failures in rounds.
pub async fn run_with_retries<L>(loader: Arc<L>, tables: Vec<String>, policy: RetryPolicy) -> RetryOutcome
where
    L: TableLoader + 'static,
{
    let mut outcome = RetryOutcome {
        states: tables.iter().map(|t| (t.clone(), TableState::Pending)).collect(),
        rounds: 0,
    };
    let semaphore = Arc::new(Semaphore::new(policy.workers.max(1)));
    let mut pending = tables;

    for attempt in 1..=policy.max_attempts.max(1) {
        if pending.is_empty() {
            break;
        }
        outcome.rounds = attempt;
        info!(
            attempt,
            tables = pending.len(),
            "Starting load round {} of {}",
            attempt,
            policy.max_attempts
        );

        let mut running = FuturesUnordered::new();
        for table in pending.drain(..) {
            outcome
                .states
                .insert(table.clone(), TableState::Attempting { attempt });
            let loader = Arc::clone(&loader);
            let semaphore = Arc::clone(&semaphore);
            let name = table.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| MigrateError::pool(e, "waiting for a load worker"))?;
                loader.load_table(&name).await
            });
            running.push(async move { (table, handle.await) });
        }

        // Completion order is arbitrary.
        while let Some((table, joined)) = running.next().await {
            let result = match joined {
                Ok(r) => r.map_err(|e| e.to_string()),
                Err(e) => Err(format!("load task panicked: {}", e)),
            };
            let state = match result {
                Ok(rows) => {
                    info!(table = %table, attempt, rows, "Loaded {} ({} rows)", table, rows);
                    TableState::Succeeded { attempts: attempt, rows }
                }
                Err(error) if attempt < policy.max_attempts => {
                    warn!(table = %table, attempt, "Load of {} failed, will retry: {}", table, error);
                    pending.push(table.clone());
                    TableState::RetryableFailed { attempt, error }
                }
                Err(error) => {
                    error!(table = %table, attempt, "Load of {} permanently failed: {}", table, error);
                    TableState::PermanentlyFailed { attempts: attempt, error }
                }
            };
            outcome.states.insert(table, state);
        }
        pending.sort();
    }

    outcome
}
