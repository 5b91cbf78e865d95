//! Calls into the external transformation process
//!
//! One `invoke` is one logical oracle call: it renders the prompt, runs the
//! transport up to the retry ceiling, extracts records from the reply and
//! checks that the identities that came back are exactly the ones sent.

use crate::config::OracleConfig;
use crate::extract::extract_with_strategy;
use crate::record::Record;
use crate::util::{run_command_with_timeout, tail_chars, truncate};
use std::collections::HashSet;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

const STDERR_TAIL_MAX_CHARS: usize = 2_000;
const RESPONSE_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Batch,
    /// Narrower instructions for one record with a troublesome identity.
    Single,
}

#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub deadline: Duration,
    pub max_retries: u32,
    pub mode: PromptMode,
}

impl CallPolicy {
    pub fn main_pass(config: &OracleConfig) -> Self {
        Self {
            deadline: config.deadline(),
            max_retries: config.max_retries,
            mode: PromptMode::Batch,
        }
    }

    pub fn reconcile(config: &OracleConfig) -> Self {
        Self {
            deadline: config.deadline(),
            max_retries: config.reconcile_max_retries,
            mode: PromptMode::Batch,
        }
    }

    pub fn single(config: &OracleConfig) -> Self {
        Self {
            deadline: config.single_deadline(),
            max_retries: config.reconcile_max_retries,
            mode: PromptMode::Single,
        }
    }
}

/// What the transport sees for one attempt.
#[derive(Debug)]
pub struct OracleRequest<'a> {
    pub prompt: &'a str,
    pub batch: &'a [Record],
    pub attempt: u32,
}

#[derive(Debug, Clone, Default)]
pub struct OracleReply {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Executes a rendered prompt. The process implementation is the only one
/// used in production; tests plug in scripted transports.
pub trait Transport {
    fn call(&mut self, request: &OracleRequest<'_>, deadline: Duration) -> Result<OracleReply, String>;
}

/// Runs the configured program with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

impl Transport for ProcessTransport {
    fn call(&mut self, request: &OracleRequest<'_>, deadline: Duration) -> Result<OracleReply, String> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        let result = run_command_with_timeout(&mut command, Some(request.prompt), deadline)?;
        debug!(
            program = %self.program,
            elapsed_ms = result.elapsed.as_millis() as u64,
            timed_out = result.timed_out,
            "oracle process finished"
        );
        Ok(OracleReply {
            success: result.success(),
            exit_code: result.exit_code(),
            stdout: result.stdout,
            stderr: tail_chars(&result.stderr, STDERR_TAIL_MAX_CHARS),
            timed_out: result.timed_out,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Every attempt exited non-zero or could not be started.
    ProcessExit { code: Option<i32> },
    /// The reply reads like an oracle-side error message rather than a payload.
    OracleError,
    /// Records came back, but not exactly the identities that were sent.
    IdentityMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    /// The batch could not be rendered into a prompt.
    Encode(String),
}

/// Kept so the orchestrator can persist it before aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalDiagnostic {
    pub prompt: String,
    pub response: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Success(Vec<Record>),
    StructuralFailure(FailureKind),
    Timeout,
    FatalError(FatalDiagnostic),
}

pub struct OracleClient<T> {
    transport: T,
    preamble: String,
    single_preamble: String,
    invocations: usize,
}

impl<T: Transport> OracleClient<T> {
    pub fn new(transport: T, config: &OracleConfig) -> Self {
        Self {
            transport,
            preamble: config.preamble.clone(),
            single_preamble: config.single_preamble.clone(),
            invocations: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of logical `invoke` calls made so far.
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn render_prompt(&self, batch: &[Record], mode: PromptMode) -> serde_json::Result<String> {
        match mode {
            PromptMode::Batch => {
                let payload = serde_json::to_string_pretty(batch)?;
                Ok(format!("{}\n\n{}", self.preamble, payload))
            }
            PromptMode::Single => {
                let payload = match batch {
                    [single] => serde_json::to_string_pretty(single)?,
                    _ => serde_json::to_string_pretty(batch)?,
                };
                Ok(format!("{}\n\n{}", self.single_preamble, payload))
            }
        }
    }

    pub fn invoke(&mut self, batch: &[Record], policy: &CallPolicy) -> TransformOutcome {
        self.invocations += 1;
        let prompt = match self.render_prompt(batch, policy.mode) {
            Ok(prompt) => prompt,
            Err(err) => return TransformOutcome::StructuralFailure(FailureKind::Encode(err.to_string())),
        };

        let attempts = policy.max_retries.max(1);
        let mut last_failure = FailureKind::ProcessExit { code: None };

        for attempt in 1..=attempts {
            let is_last = attempt == attempts;
            let request = OracleRequest {
                prompt: &prompt,
                batch,
                attempt,
            };

            let reply = match self.transport.call(&request, policy.deadline) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "oracle could not be run");
                    last_failure = FailureKind::ProcessExit { code: None };
                    continue;
                }
            };

            if reply.timed_out {
                warn!(
                    size = batch.len(),
                    deadline_secs = policy.deadline.as_secs(),
                    "oracle call hit its deadline"
                );
                return TransformOutcome::Timeout;
            }

            if !reply.success {
                warn!(
                    attempt,
                    attempts,
                    code = ?reply.exit_code,
                    stderr = %truncate(reply.stderr.trim(), RESPONSE_PREVIEW_CHARS),
                    "oracle exited with non-zero status"
                );
                last_failure = FailureKind::ProcessExit {
                    code: reply.exit_code,
                };
                continue;
            }

            let response = reply.stdout.trim();
            match extract_with_strategy(response) {
                Some(extraction) => match check_identities(batch, &extraction.records) {
                    Ok(()) => {
                        debug!(
                            size = batch.len(),
                            strategy = extraction.strategy.label(),
                            "extracted oracle reply"
                        );
                        return TransformOutcome::Success(extraction.records);
                    }
                    Err(mismatch) => {
                        if let FailureKind::IdentityMismatch { missing, unexpected } = &mismatch {
                            warn!(
                                attempt,
                                attempts,
                                sent = batch.len(),
                                received = extraction.records.len(),
                                missing = ?missing,
                                unexpected = ?unexpected,
                                "oracle reply does not match the identities sent"
                            );
                        }
                        if is_last {
                            return TransformOutcome::StructuralFailure(mismatch);
                        }
                        last_failure = mismatch;
                    }
                },
                None => {
                    if !is_last {
                        warn!(
                            attempt,
                            attempts,
                            preview = %truncate(response, RESPONSE_PREVIEW_CHARS),
                            "no records could be extracted from the oracle reply"
                        );
                        last_failure = FailureKind::OracleError;
                        continue;
                    }
                    if looks_like_oracle_error(response) {
                        warn!(attempts, "oracle keeps answering with an error; shrinking");
                        return TransformOutcome::StructuralFailure(FailureKind::OracleError);
                    }
                    return TransformOutcome::FatalError(FatalDiagnostic {
                        prompt,
                        response: response.to_string(),
                        attempts: attempt,
                    });
                }
            }
        }

        TransformOutcome::StructuralFailure(last_failure)
    }
}

fn looks_like_oracle_error(response: &str) -> bool {
    response.to_ascii_lowercase().contains("error")
}

/// The reply must carry exactly the sent identities, once each.
fn check_identities(sent: &[Record], received: &[Record]) -> Result<(), FailureKind> {
    let sent_ids: HashSet<&str> = sent.iter().map(|r| r.id.as_str()).collect();
    let received_ids: HashSet<&str> = received.iter().map(|r| r.id.as_str()).collect();

    if received.len() == sent.len() && sent_ids == received_ids {
        return Ok(());
    }

    let missing = sent
        .iter()
        .filter(|r| !received_ids.contains(r.id.as_str()))
        .map(|r| r.id.clone())
        .collect();
    let unexpected = received
        .iter()
        .filter(|r| !sent_ids.contains(r.id.as_str()))
        .map(|r| r.id.clone())
        .collect();
    Err(FailureKind::IdentityMismatch { missing, unexpected })
}
