use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a run early. Recoverable oracle failures (timeouts,
/// malformed replies, identity mismatches) never leave the orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "oracle produced uninterpretable output for batch {batch} after {attempts} attempts; prompt and reply saved to {}",
        artifact.display()
    )]
    FatalOracle {
        batch: usize,
        attempts: u32,
        artifact: PathBuf,
    },

    #[error("another run holds the ledger lock at {}", path.display())]
    Locked { path: PathBuf },

    #[error("input contains duplicate identities: {}", ids.join(", "))]
    DuplicateIdentities { ids: Vec<String> },

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl RunError {
    pub fn is_fatal_oracle(&self) -> bool {
        matches!(self, RunError::FatalOracle { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_message_points_at_artifact() {
        let err = RunError::FatalOracle {
            batch: 7,
            attempts: 3,
            artifact: PathBuf::from("diag/diagnostic_batch_7_attempt_3.txt"),
        };
        let message = err.to_string();
        assert!(message.contains("batch 7"));
        assert!(message.contains("diagnostic_batch_7_attempt_3.txt"));
        assert!(err.is_fatal_oracle());
    }
}
