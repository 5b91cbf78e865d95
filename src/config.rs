//! Run configuration
//!
//! Read from a TOML file (`--config`, or `~/.config/chunkwise/config.toml`
//! when it exists). Every key is optional; missing keys take the defaults below.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::record::APOSTROPHE_LIKE;

const DEFAULT_PREAMBLE: &str = "Transform every object of the JSON array below and reply with the \
transformed JSON array only. Keep exactly the same structure and the same keys. Never change the \
value of any \"id\" key. Keep null values as null. Do not add any text or comment before or after \
the array.";

const DEFAULT_SINGLE_PREAMBLE: &str = "Transform the single JSON object below and reply with one \
JSON object only. Keep the \"id\" value exactly as it is, character for character. Keep null \
values as null. Do not add any text before or after the object.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub source: SourceConfig,
    pub oracle: OracleConfig,
    pub sizing: SizingConfig,
    pub reconcile: ReconcileConfig,
    pub output: OutputConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Remote JSON array of records; ignored when an input file is given.
    pub url: Option<String>,
    /// Replace apostrophe-like characters in identities with `_` before the run.
    pub sanitize_ids: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            sanitize_ids: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub program: String,
    pub args: Vec<String>,
    pub preamble: String,
    pub single_preamble: String,
    pub deadline_secs: u64,
    pub single_deadline_secs: u64,
    pub max_retries: u32,
    pub reconcile_max_retries: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: Vec::new(),
            preamble: DEFAULT_PREAMBLE.to_string(),
            single_preamble: DEFAULT_SINGLE_PREAMBLE.to_string(),
            deadline_secs: 120,
            single_deadline_secs: 60,
            max_retries: 3,
            reconcile_max_retries: 5,
        }
    }
}

impl OracleConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn single_deadline(&self) -> Duration {
        Duration::from_secs(self.single_deadline_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizingPolicy {
    /// Double on success, bisect once a size fails.
    DoublingBisection,
    /// Start large and step down by one on every failure.
    LinearDecrement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub policy: SizingPolicy,
    pub seed_size: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            policy: SizingPolicy::DoublingBisection,
            seed_size: 18,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub max_rounds: usize,
    pub start_size: usize,
    /// Send records with problematic identities through the single-record path first.
    pub isolate_problematic: bool,
    pub problematic_chars: Vec<char>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            start_size: 6,
            isolate_problematic: true,
            problematic_chars: APOSTROPHE_LIKE.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub artifact_dir: PathBuf,
    /// Pause after each successful main-pass batch.
    pub pause_ms: u64,
    /// Separator rewrite applied to every ledger identity once reconciliation is over.
    pub rewrite_separator: Option<SeparatorRewrite>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("transformed.json"),
            artifact_dir: PathBuf::from("."),
            pause_ms: 1_000,
            rewrite_separator: Some(SeparatorRewrite { from: '_', to: '-' }),
        }
    }
}

impl OutputConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparatorRewrite {
    pub from: char,
    pub to: char,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub repo_path: PathBuf,
    pub branch_prefix: String,
    pub base_branch: String,
    pub remote: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_path: PathBuf::from("."),
            branch_prefix: "new_translation".to_string(),
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
        }
    }
}

impl RunConfig {
    /// Default config file location, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("chunkwise").join("config.toml"))
    }

    /// Load the config from `path`, or from the default location when it
    /// exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default_path) => Self::from_file(&default_path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config TOML '{}'", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.oracle.program.trim().is_empty() {
            return Err(anyhow!("oracle.program must not be empty"));
        }
        if self.oracle.deadline_secs == 0 || self.oracle.single_deadline_secs == 0 {
            return Err(anyhow!("oracle deadlines must be at least one second"));
        }
        if self.oracle.max_retries == 0 || self.oracle.reconcile_max_retries == 0 {
            return Err(anyhow!("oracle retry ceilings must be at least 1"));
        }
        if self.sizing.seed_size == 0 {
            return Err(anyhow!("sizing.seed_size must be at least 1"));
        }
        if self.reconcile.start_size == 0 || self.reconcile.max_rounds == 0 {
            return Err(anyhow!("reconcile.start_size and reconcile.max_rounds must be at least 1"));
        }
        if let Some(url) = self.source.url.as_deref() {
            url::Url::parse(url).with_context(|| format!("Invalid source.url '{}'", url))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.oracle.deadline(), Duration::from_secs(120));
        assert_eq!(config.oracle.max_retries, 3);
        assert_eq!(config.oracle.reconcile_max_retries, 5);
        assert_eq!(config.sizing.policy, SizingPolicy::DoublingBisection);
        assert_eq!(config.reconcile.max_rounds, 3);
        assert_eq!(config.reconcile.start_size, 6);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RunConfig::from_toml(
            r#"
[oracle]
program = "my-oracle"
args = ["--json"]

[sizing]
policy = "linear-decrement"
seed_size = 10

[output]
path = "out/data.json"
rewrite_separator = { from = "_", to = "-" }
"#,
        )
        .unwrap();
        assert_eq!(config.oracle.program, "my-oracle");
        assert_eq!(config.oracle.args, vec!["--json".to_string()]);
        assert_eq!(config.oracle.deadline_secs, 120);
        assert_eq!(config.sizing.policy, SizingPolicy::LinearDecrement);
        assert_eq!(config.sizing.seed_size, 10);
        assert_eq!(config.output.path, PathBuf::from("out/data.json"));
        assert_eq!(config.reconcile.start_size, 6);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RunConfig::default();
        config.sizing.seed_size = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.source.url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.oracle.program = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[reconcile]\nmax_rounds = 5\n").unwrap();
        let config = RunConfig::load(Some(&path)).unwrap();
        assert_eq!(config.reconcile.max_rounds, 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
