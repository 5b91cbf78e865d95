//! Loading the input record set
//!
//! The set is a JSON array of objects, each with a string `id`. It comes
//! either from a URL or from a local file; either way it is validated before
//! the orchestrator sees it.

use crate::record::{sanitize_ids, Record};
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::info;

const USER_AGENT: &str = concat!("chunkwise/", env!("CARGO_PKG_VERSION"));

/// Fetch the input set over HTTP.
pub async fn fetch_records(url: &str) -> Result<Vec<Record>> {
    let url = url::Url::parse(url).with_context(|| format!("Invalid source URL '{}'", url))?;
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("Failed to fetch input from {}", url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("Fetching {} returned HTTP {}", url, status));
    }
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read response body from {}", url))?;

    let records = parse_records(&body).with_context(|| format!("Unexpected input format at {}", url))?;
    info!(url = %url, count = records.len(), "fetched input records");
    Ok(records)
}

/// Read the input set from a JSON file.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input '{}'", path.display()))?;
    let records = parse_records(&content)
        .with_context(|| format!("Unexpected input format in '{}'", path.display()))?;
    info!(path = %path.display(), count = records.len(), "loaded input records");
    Ok(records)
}

pub fn parse_records(content: &str) -> Result<Vec<Record>> {
    let records: Vec<Record> =
        serde_json::from_str(content).context("Input must be a JSON array of objects with a string \"id\"")?;
    if let Some(position) = records.iter().position(|r| r.id.trim().is_empty()) {
        return Err(anyhow!("Record at index {} has an empty id", position));
    }
    Ok(records)
}

/// Apply identity sanitising when enabled, logging how many ids changed.
pub fn prepare(mut records: Vec<Record>, sanitize: bool) -> Vec<Record> {
    if sanitize {
        let changed = sanitize_ids(&mut records);
        if changed > 0 {
            info!(changed, "sanitised apostrophe-like characters in identities");
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_records_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(
            &path,
            r#"[{"id":"horus","name":"Horus","tags":["warmaster"]},{"id":"sanguinius","name":null}]"#,
        )
        .unwrap();

        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field_str("name"), Some("Horus"));
        assert!(records[1].fields["name"].is_null());
    }

    #[test]
    fn test_parse_rejects_missing_or_empty_id() {
        assert!(parse_records(r#"[{"name":"no id"}]"#).is_err());
        assert!(parse_records(r#"[{"id":"  "}]"#).is_err());
        assert!(parse_records(r#"{"id":"not an array"}"#).is_err());
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_records(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("/definitely/not/here.json"));
    }

    #[test]
    fn test_prepare_sanitises_when_enabled() {
        let records = vec![Record::new("emperor\u{2019}s-wrath"), Record::new("plain")];
        let prepared = prepare(records.clone(), true);
        assert_eq!(prepared[0].id, "emperor_s-wrath");
        assert_eq!(prepared[1].id, "plain");

        let untouched = prepare(records, false);
        assert_eq!(untouched[0].id, "emperor\u{2019}s-wrath");
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        assert!(fetch_records("not a url").await.is_err());
    }
}
