//! Files written for humans when a run cannot finish cleanly

use crate::oracle::FatalDiagnostic;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

pub const UNRESOLVED_IDS_FILE: &str = "unresolved_ids.txt";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    run_id: Uuid,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, run_id: Uuid) -> Self {
        Self {
            dir: dir.into(),
            run_id,
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create artifact directory '{}'", self.dir.display()))
    }

    /// Save the prompt and reply that made the oracle unusable.
    pub fn write_diagnostic(&self, batch: usize, diagnostic: &FatalDiagnostic) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(format!(
            "diagnostic_batch_{}_attempt_{}.txt",
            batch, diagnostic.attempts
        ));
        let content = format!(
            "Run: {}\nWritten: {}\nAttempts: {}\n\nPrompt:\n{}\n\nResponse:\n{}\n",
            self.run_id,
            Utc::now().to_rfc3339(),
            diagnostic.attempts,
            diagnostic.prompt,
            diagnostic.response
        );
        fs::write(&path, content)
            .with_context(|| format!("Failed to write diagnostic '{}'", path.display()))?;
        Ok(path)
    }

    /// One identity per line.
    pub fn write_unresolved(&self, ids: &[String]) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(UNRESOLVED_IDS_FILE);
        let mut content = ids.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&path, content)
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        Ok(path)
    }

    /// Drop a stale unresolved list left by an earlier incomplete run.
    pub fn clear_unresolved(&self) -> Result<()> {
        let path = self.dir.join(UNRESOLVED_IDS_FILE);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove '{}'", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_contains_prompt_and_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("diag"), Uuid::new_v4());
        let path = store
            .write_diagnostic(
                4,
                &FatalDiagnostic {
                    prompt: "PROMPT".to_string(),
                    response: "garbage".to_string(),
                    attempts: 3,
                },
            )
            .unwrap();
        assert!(path.ends_with("diagnostic_batch_4_attempt_3.txt"));
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("Prompt:\nPROMPT"));
        assert!(content.contains("Response:\ngarbage"));
    }

    #[test]
    fn test_unresolved_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Uuid::new_v4());
        let path = store
            .write_unresolved(&["x".to_string(), "y'z".to_string()])
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x\ny'z\n");
        store.clear_unresolved().unwrap();
        assert!(!path.exists());
    }
}
