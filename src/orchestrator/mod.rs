//! Drives a whole run: main pass, reconciliation, final verification
//!
//! The orchestrator owns every piece of run state. Only a fatal oracle
//! failure or a persistence error leaves `run` early; everything else is
//! absorbed by the size controller or deferred to reconciliation.

use crate::artifacts::ArtifactStore;
use crate::config::RunConfig;
use crate::error::RunError;
use crate::ledger::{read_snapshot, LedgerLock, ProgressLedger};
use crate::oracle::{CallPolicy, FailureKind, OracleClient, Transport, TransformOutcome};
use crate::reconcile::{ReconcileSummary, ReconciliationEngine};
use crate::record::{duplicate_ids, normalization_collisions, normalize_id, Record};
use crate::sizing::{Adjustment, BatchSizeController};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of one attempted batch, with successes already merged.
#[derive(Debug)]
pub(crate) enum BatchResult {
    Merged { added: usize },
    Timeout,
    Structural(FailureKind),
}

/// State shared by the main pass and reconciliation.
pub(crate) struct RunContext<T> {
    pub(crate) oracle: OracleClient<T>,
    pub(crate) ledger: ProgressLedger,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) batches: usize,
}

impl<T: Transport> RunContext<T> {
    /// Send one batch and merge whatever succeeded. A fatal oracle outcome
    /// is written out as a diagnostic and turned into an error.
    pub(crate) fn attempt(&mut self, batch: &[Record], policy: &CallPolicy) -> Result<BatchResult, RunError> {
        self.batches += 1;
        let number = self.batches;
        match self.oracle.invoke(batch, policy) {
            TransformOutcome::Success(records) => {
                let added = self.ledger.merge(records)?;
                Ok(BatchResult::Merged { added })
            }
            TransformOutcome::Timeout => Ok(BatchResult::Timeout),
            TransformOutcome::StructuralFailure(kind) => Ok(BatchResult::Structural(kind)),
            TransformOutcome::FatalError(diagnostic) => {
                let artifact = self.artifacts.write_diagnostic(number, &diagnostic)?;
                error!(
                    batch = number,
                    attempts = diagnostic.attempts,
                    artifact = %artifact.display(),
                    "oracle output could not be interpreted, aborting run"
                );
                Err(RunError::FatalOracle {
                    batch: number,
                    attempts: diagnostic.attempts,
                    artifact,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MainPassSummary {
    pub attempted: usize,
    pub batches: usize,
    /// Records skipped because even a batch of one failed.
    pub deferred: Vec<String>,
    pub converged_size: Option<usize>,
    pub probes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub total: usize,
    pub resumed: usize,
    pub main_pass: MainPassSummary,
    pub reconcile: ReconcileSummary,
    pub rewritten: usize,
    pub verification: Verification,
    pub unresolved_path: Option<PathBuf>,
    pub oracle_calls: usize,
    pub status: RunStatus,
}

/// Comparison of the persisted output against the input, by normalized identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub expected: usize,
    pub present: usize,
    pub unresolved: Vec<String>,
    /// Input identities that normalize to the same key; they cannot be told apart.
    pub collisions: Vec<Vec<String>>,
    /// Output entries sharing a normalized key with another output entry.
    pub duplicate_outputs: usize,
}

impl Verification {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Check the snapshot at `output` against `input`.
pub fn verify(input: &[Record], output: &Path) -> Result<Verification> {
    let records = read_snapshot(output)?;
    let present: HashSet<String> = records.iter().map(|r| normalize_id(&r.id)).collect();
    let unresolved: Vec<String> = input
        .iter()
        .filter(|r| !present.contains(&normalize_id(&r.id)))
        .map(|r| r.id.clone())
        .collect();

    Ok(Verification {
        expected: input.len(),
        present: input.len() - unresolved.len(),
        unresolved,
        collisions: normalization_collisions(input.iter().map(|r| r.id.as_str())),
        duplicate_outputs: records.len() - present.len(),
    })
}

pub struct Orchestrator<T> {
    config: RunConfig,
    input: Vec<Record>,
    ctx: RunContext<T>,
    sizing: BatchSizeController,
    run_id: Uuid,
    resumed: usize,
    _lock: LedgerLock,
}

impl<T: Transport> Orchestrator<T> {
    /// Validate the input, take the ledger lock and resume any earlier progress.
    pub fn new(config: RunConfig, transport: T, input: Vec<Record>) -> Result<Self, RunError> {
        let duplicates = duplicate_ids(&input);
        if !duplicates.is_empty() {
            return Err(RunError::DuplicateIdentities { ids: duplicates });
        }

        let lock = LedgerLock::acquire(&config.output.path)?;
        debug!(lock = %lock.path().display(), "run lock held");
        let ledger = ProgressLedger::open(&config.output.path, &input)?;
        let resumed = ledger.len();
        if resumed > 0 {
            info!(resumed, path = %config.output.path.display(), "resuming from existing ledger");
        }

        let run_id = Uuid::new_v4();
        let ctx = RunContext {
            oracle: OracleClient::new(transport, &config.oracle),
            ledger,
            artifacts: ArtifactStore::new(&config.output.artifact_dir, run_id),
            batches: 0,
        };
        let sizing = BatchSizeController::new(config.sizing.policy, config.sizing.seed_size);

        Ok(Self {
            config,
            input,
            ctx,
            sizing,
            run_id,
            resumed,
            _lock: lock,
        })
    }

    pub fn transport(&self) -> &T {
        self.ctx.oracle.transport()
    }

    /// Main pass, reconciliation, identity rewrite, verification.
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        info!(run_id = %self.run_id, total = self.input.len(), resumed = self.resumed, "starting run");

        let main_pass = self.main_pass()?;
        let engine = ReconciliationEngine::new(&self.config.reconcile, &self.config.oracle);
        let reconcile = engine.run(&mut self.ctx, &self.input, main_pass.converged_size)?;

        let rewritten = match self.config.output.rewrite_separator {
            Some(rewrite) => self.ctx.ledger.rewrite_ids(rewrite.from, rewrite.to)?,
            None => {
                self.ctx.ledger.snapshot()?;
                0
            }
        };

        let verification = verify(&self.input, self.ctx.ledger.path())?;
        for group in &verification.collisions {
            warn!(ids = ?group, "input identities collide after normalization");
        }

        let (status, unresolved_path) = if verification.is_complete() {
            self.ctx.artifacts.clear_unresolved()?;
            info!(total = verification.expected, "all records transformed");
            (RunStatus::Complete, None)
        } else {
            let path = self.ctx.artifacts.write_unresolved(&verification.unresolved)?;
            warn!(
                unresolved = verification.unresolved.len(),
                path = %path.display(),
                "run finished with records still missing"
            );
            (RunStatus::Incomplete, Some(path))
        };

        Ok(RunReport {
            run_id: self.run_id,
            total: self.input.len(),
            resumed: self.resumed,
            main_pass,
            reconcile,
            rewritten,
            verification,
            unresolved_path,
            oracle_calls: self.ctx.oracle.invocations(),
            status,
        })
    }

    fn main_pass(&mut self) -> Result<MainPassSummary, RunError> {
        let pending: Vec<Record> = self.ctx.ledger.missing(&self.input).into_iter().cloned().collect();
        let policy = CallPolicy::main_pass(&self.config.oracle);
        let pause = self.config.output.pause();
        let first_batch = self.ctx.batches;

        let mut summary = MainPassSummary {
            attempted: pending.len(),
            ..Default::default()
        };
        let mut position = 0;
        let mut announced = false;

        while position < pending.len() {
            let size = self.sizing.next_size(pending.len() - position);
            let batch = &pending[position..position + size];
            debug!(position, size, pending = pending.len(), "sending batch");

            let adjustment = match self.ctx.attempt(batch, &policy)? {
                BatchResult::Merged { added } => {
                    self.sizing.record_success(size);
                    position += size;
                    info!(
                        added,
                        done = self.ctx.ledger.len(),
                        total = self.input.len(),
                        "batch transformed"
                    );
                    if !announced {
                        if let Some(converged) = self.sizing.converged() {
                            announced = true;
                            log_estimate(pending.len() - position, converged, policy.deadline);
                        }
                    }
                    if position < pending.len() && !pause.is_zero() {
                        thread::sleep(pause);
                    }
                    continue;
                }
                BatchResult::Timeout => self.sizing.record_timeout(size),
                BatchResult::Structural(kind) => {
                    debug!(failure = ?kind, size, "batch failed structurally");
                    self.sizing.record_structural_failure(size)
                }
            };

            match adjustment {
                Adjustment::Retry { size } => debug!(size, "retrying position with a smaller batch"),
                Adjustment::SkipRecord => {
                    let id = pending[position].id.clone();
                    warn!(id = %id, "record fails on its own, deferring to reconciliation");
                    summary.deferred.push(id);
                    position += 1;
                }
            }
        }

        summary.batches = self.ctx.batches - first_batch;
        summary.converged_size = self.sizing.converged();
        summary.probes = self.sizing.probes();
        info!(
            batches = summary.batches,
            deferred = summary.deferred.len(),
            converged = ?summary.converged_size,
            "main pass finished"
        );
        Ok(summary)
    }
}

fn log_estimate(remaining: usize, converged: usize, deadline: Duration) {
    let chunks = remaining.div_ceil(converged.max(1));
    info!(
        size = converged,
        remaining_batches = chunks,
        worst_case_secs = deadline.as_secs() * chunks as u64,
        "batch size settled"
    );
}
