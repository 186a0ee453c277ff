//! Filesystem-backed outcome ledger.
//!
//! Layout: `<root>/<experiment>/<arm>.jsonl`, one JSON-encoded [`Sample`] per
//! line. Files are only ever opened in append mode; replaying an arm after a
//! restart yields exactly the sequence that was recorded before it.
//!
//! Each arm has its own append lock and an in-memory sample count, loaded by
//! one replay the first time the arm is touched. Appends to one arm never
//! wait on another, and an append costs one write regardless of arm length.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::{ArmId, LedgerResult, OutcomeLedger, Sample};

const EXTENSION: &str = "jsonl";

#[derive(Debug, Default)]
struct ArmFile {
    /// Lines in the file; `None` until the first replay.
    count: Option<usize>,
}

/// Append-only JSONL ledger rooted at a directory.
pub struct JsonlOutcomeLedger {
    root: PathBuf,
    // One lock per arm so concurrent writers never interleave partial lines.
    files: DashMap<ArmId, Arc<Mutex<ArmFile>>>,
}

impl JsonlOutcomeLedger {
    /// Create a ledger rooted at `root`. Creates the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> LedgerResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            files: DashMap::new(),
        })
    }

    fn arm_path(&self, arm: &ArmId) -> PathBuf {
        self.root
            .join(&arm.experiment)
            .join(format!("{}.{EXTENSION}", arm.arm))
    }

    fn file(&self, arm: &ArmId) -> Arc<Mutex<ArmFile>> {
        Arc::clone(self.files.entry(arm.clone()).or_default().value())
    }

    async fn replay(&self, arm: &ArmId) -> LedgerResult<Vec<Sample>> {
        let path = self.arm_path(arm);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(arm)),
            Err(e) => return Err(e.into()),
        };

        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| LedgerError::Corrupt {
                    arm: arm.to_string(),
                    line: idx + 1,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Cached line count, replaying the file once if it is not loaded yet.
    async fn loaded_count(&self, arm: &ArmId, file: &mut ArmFile) -> LedgerResult<usize> {
        if let Some(count) = file.count {
            return Ok(count);
        }
        let count = self.replay(arm).await?.len();
        file.count = Some(count);
        Ok(count)
    }
}

fn validate_name(name: &str) -> LedgerResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(LedgerError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn not_found(arm: &ArmId) -> LedgerError {
    LedgerError::ArmNotFound {
        arm: arm.to_string(),
    }
}

#[async_trait]
impl OutcomeLedger for JsonlOutcomeLedger {
    async fn open_arm(&self, experiment: &str, arm: &str) -> LedgerResult<ArmId> {
        validate_name(experiment)?;
        validate_name(arm)?;
        let id = ArmId::new(experiment, arm);
        let path = self.arm_path(&id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(arm = %id, "opened ledger arm");
        Ok(id)
    }

    async fn record(&self, arm: &ArmId, sample: Sample) -> LedgerResult<usize> {
        sample.validate()?;
        let path = self.arm_path(arm);
        if !tokio::fs::try_exists(&path).await? {
            return Err(not_found(arm));
        }
        let mut line = serde_json::to_vec(&sample)?;
        line.push(b'\n');

        let handle = self.file(arm);
        let mut state = handle.lock().await;
        let count = self.loaded_count(arm, &mut state).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        state.count = Some(count + 1);
        Ok(count + 1)
    }

    async fn read(&self, arm: &ArmId) -> LedgerResult<Vec<Sample>> {
        let handle = self.file(arm);
        let mut state = handle.lock().await;
        let samples = self.replay(arm).await?;
        state.count = Some(samples.len());
        Ok(samples)
    }

    async fn len(&self, arm: &ArmId) -> LedgerResult<usize> {
        let handle = self.file(arm);
        let mut state = handle.lock().await;
        self.loaded_count(arm, &mut state).await
    }

    async fn arms(&self, experiment: &str) -> LedgerResult<Vec<ArmId>> {
        validate_name(experiment)?;
        let dir = self.root.join(experiment);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut arms = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                arms.push(ArmId::new(experiment, stem));
            }
        }
        arms.sort();
        Ok(arms)
    }
}
