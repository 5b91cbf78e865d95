//! Catch-up rounds over records the main pass could not transform
//!
//! Each round recomputes the missing set from the ledger, gives records with
//! troublesome identities a call of their own, then retries the rest in small
//! batches that halve on failure. A round that recovers nothing ends the
//! reconciliation: repeating it would only repeat the same failures.

use crate::config::{OracleConfig, ReconcileConfig};
use crate::error::RunError;
use crate::oracle::{CallPolicy, Transport};
use crate::orchestrator::{BatchResult, RunContext};
use crate::record::{contains_any, Record};
use serde::Serialize;
use std::slice;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub rounds: usize,
    pub recovered: usize,
    pub isolated_attempts: usize,
    /// True when a round made no progress and the remaining rounds were skipped.
    pub stalled: bool,
    pub remaining: usize,
}

pub struct ReconciliationEngine {
    config: ReconcileConfig,
    batch_policy: CallPolicy,
    single_policy: CallPolicy,
}

impl ReconciliationEngine {
    pub fn new(config: &ReconcileConfig, oracle: &OracleConfig) -> Self {
        Self {
            config: config.clone(),
            batch_policy: CallPolicy::reconcile(oracle),
            single_policy: CallPolicy::single(oracle),
        }
    }

    /// Catch-up batch size: never above the size the main pass converged to.
    fn start_size(&self, converged: Option<usize>) -> usize {
        converged
            .map_or(self.config.start_size, |c| c.min(self.config.start_size))
            .max(1)
    }

    fn is_problematic(&self, record: &Record) -> bool {
        self.config.isolate_problematic && contains_any(&record.id, &self.config.problematic_chars)
    }

    pub(crate) fn run<T: Transport>(
        &self,
        ctx: &mut RunContext<T>,
        input: &[Record],
        converged: Option<usize>,
    ) -> Result<ReconcileSummary, RunError> {
        let mut summary = ReconcileSummary {
            remaining: ctx.ledger.missing(input).len(),
            ..Default::default()
        };

        for round in 1..=self.config.max_rounds {
            let missing: Vec<Record> = ctx.ledger.missing(input).into_iter().cloned().collect();
            if missing.is_empty() {
                break;
            }
            summary.rounds = round;
            let before = missing.len();
            info!(round, max_rounds = self.config.max_rounds, missing = before, "reconciliation round");

            for record in missing.iter().filter(|r| self.is_problematic(r)) {
                summary.isolated_attempts += 1;
                debug!(id = %record.id, "isolating record with problematic identity");
                match ctx.attempt(slice::from_ref(record), &self.single_policy)? {
                    BatchResult::Merged { .. } => info!(id = %record.id, "isolated record transformed"),
                    failure => warn!(id = %record.id, outcome = ?failure, "isolated call failed"),
                }
            }

            let rest: Vec<Record> = ctx.ledger.missing(&missing).into_iter().cloned().collect();
            self.catch_up(ctx, &rest, converged)?;

            let after = ctx.ledger.missing(input).len();
            summary.recovered += before - after;
            summary.remaining = after;
            info!(round, recovered = before - after, remaining = after, "reconciliation round finished");

            if after == before {
                warn!(round, remaining = after, "no progress in this round, stopping reconciliation");
                summary.stalled = true;
                break;
            }
        }

        Ok(summary)
    }

    fn catch_up<T: Transport>(
        &self,
        ctx: &mut RunContext<T>,
        records: &[Record],
        converged: Option<usize>,
    ) -> Result<(), RunError> {
        let mut size = self.start_size(converged);
        let mut position = 0;

        while position < records.len() {
            let end = (position + size).min(records.len());
            let chunk = &records[position..end];
            match ctx.attempt(chunk, &self.batch_policy)? {
                BatchResult::Merged { added } => {
                    debug!(size = chunk.len(), added, "catch-up batch merged");
                    position = end;
                }
                failure if size > 1 => {
                    size = (size / 2).max(1);
                    debug!(outcome = ?failure, size, "catch-up batch failed, halving");
                }
                failure => {
                    warn!(id = %chunk[0].id, outcome = ?failure, "record still failing on its own, leaving it for the next round");
                    position += 1;
                }
            }
        }
        Ok(())
    }
}
