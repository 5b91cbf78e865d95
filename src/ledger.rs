//! Identity-keyed record of completed transformations
//!
//! The ledger is write-once per identity and is rewritten in full after every
//! merge, so the file on disk is always a complete, valid JSON array of what
//! has been transformed so far.

use crate::error::RunError;
use crate::record::{normalization_collisions, normalize_id, Record};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ProgressLedger {
    path: PathBuf,
    inputs: HashSet<String>,
    entries: Vec<Record>,
    index: HashMap<String, usize>,
    snapshots: usize,
}

impl ProgressLedger {
    /// Empty ledger for `input`, persisted at `path`.
    pub fn new(path: impl Into<PathBuf>, input: &[Record]) -> Self {
        Self {
            path: path.into(),
            inputs: input.iter().map(|r| r.id.clone()).collect(),
            entries: Vec::new(),
            index: HashMap::new(),
            snapshots: 0,
        }
    }

    /// Ledger for `input`, resumed from an earlier snapshot at `path` if one exists.
    ///
    /// Entries whose identity was rewritten by a previous run's separator pass
    /// are mapped back to their input identity when that mapping is unambiguous;
    /// anything else that is not part of the input is dropped.
    pub fn open(path: impl Into<PathBuf>, input: &[Record]) -> Result<Self> {
        let mut ledger = Self::new(path, input);
        if !ledger.path.exists() {
            return Ok(ledger);
        }

        let previous = read_snapshot(&ledger.path)?;
        let ambiguous: HashSet<String> = normalization_collisions(input.iter().map(|r| r.id.as_str()))
            .into_iter()
            .flatten()
            .map(|id| normalize_id(&id))
            .collect();
        let by_normalized: HashMap<String, &str> = input
            .iter()
            .map(|r| (normalize_id(&r.id), r.id.as_str()))
            .filter(|(key, _)| !ambiguous.contains(key))
            .collect();

        let mut dropped = 0usize;
        for mut record in previous {
            if !ledger.inputs.contains(&record.id) {
                match by_normalized.get(&normalize_id(&record.id)) {
                    Some(original) => record.id = original.to_string(),
                    None => {
                        dropped += 1;
                        continue;
                    }
                }
            }
            ledger.insert(record);
        }

        info!(
            path = %ledger.path.display(),
            resumed = ledger.len(),
            dropped,
            "resumed progress ledger"
        );
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|r| r.id.as_str())
    }

    pub fn records(&self) -> &[Record] {
        &self.entries
    }

    /// Number of snapshots written by this ledger instance.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots
    }

    /// Input records not yet in the ledger, in input order.
    pub fn missing<'a>(&self, input: &'a [Record]) -> Vec<&'a Record> {
        input.iter().filter(|r| !self.contains(&r.id)).collect()
    }

    /// Add the records whose identity is new, then snapshot.
    ///
    /// Identities outside the input set are refused; already present ones are
    /// ignored (first successful transformation wins).
    pub fn merge(&mut self, records: Vec<Record>) -> Result<usize> {
        let mut added = 0;
        for record in records {
            if !self.inputs.contains(&record.id) {
                warn!(id = %record.id, "refusing record whose identity is not part of the input");
                continue;
            }
            if self.insert(record) {
                added += 1;
            }
        }
        self.snapshot()?;
        debug!(added, total = self.len(), "merged batch into ledger");
        Ok(added)
    }

    fn insert(&mut self, record: Record) -> bool {
        if self.index.contains_key(&record.id) {
            return false;
        }
        self.index.insert(record.id.clone(), self.entries.len());
        self.entries.push(record);
        true
    }

    /// Rewrite the full ledger to disk, atomically.
    pub fn snapshot(&mut self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write ledger '{}'", self.path.display()))?;
        self.snapshots += 1;
        Ok(())
    }

    /// Replace `from` with `to` in every identity and snapshot once.
    ///
    /// Runs after reconciliation; from then on identities no longer match the
    /// input verbatim and comparisons must go through `normalize_id`.
    pub fn rewrite_ids(&mut self, from: char, to: char) -> Result<usize> {
        let mut changed = 0;
        for record in self.entries.iter_mut() {
            if record.id.contains(from) {
                record.id = record.id.replace(from, &to.to_string());
                changed += 1;
            }
        }
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        self.snapshot()?;
        info!(changed, from = %from, to = %to, "rewrote ledger identities");
        Ok(changed)
    }
}

/// Load a snapshot written by `ProgressLedger::snapshot`.
pub fn read_snapshot(path: &Path) -> Result<Vec<Record>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read ledger '{}'", path.display()))?;
    let records = serde_json::from_str(&content)
        .with_context(|| format!("Ledger '{}' is not a JSON array of records", path.display()))?;
    Ok(records)
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Exclusive lock next to the ledger file, held for the whole run.
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
    path: PathBuf,
}

impl LedgerLock {
    pub fn acquire(ledger_path: &Path) -> Result<Self, RunError> {
        let mut lock_name = ledger_path.as_os_str().to_owned();
        lock_name.push(".lock");
        let path = PathBuf::from(lock_name);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(RunError::Locked { path }),
            Err(err) => Err(RunError::Persistence(anyhow::Error::new(err).context(format!(
                "Failed to lock '{}'",
                path.display()
            )))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
