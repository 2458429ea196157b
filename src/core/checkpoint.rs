//! Checkpoints for resuming interrupted runs.
//!
//! Each checkpoint is one JSONL line holding the serialized checkpoint body
//! and a SHA-256 digest of exactly those bytes. Loading verifies the digest
//! of the latest line; a mismatch or unparseable line is a
//! [`WorkflowError::CheckpointCorruption`], which forces a clean restart.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::context::{ContextEntry, ContextSnapshot};
use crate::domain::{Event, EventLogEntry};
use crate::error::{WorkflowError, WorkflowResult};

/// Durable snapshot of workflow progress after a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,

    /// Step whose completion produced this checkpoint
    pub step_name: String,

    /// Events the step consumed
    pub input: Vec<Event>,

    /// Context entries the step wrote
    pub context_diff: Vec<ContextEntry>,

    /// Full committed context at checkpoint time
    pub context_snapshot: ContextSnapshot,

    /// Produced but unconsumed events, including partial collections
    pub pending: Vec<Event>,

    pub event_log: Vec<EventLogEntry>,
    pub next_sequence: u64,
    pub step_executions: u32,
    pub created_at: DateTime<Utc>,
}

/// On-disk line format
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointLine {
    run_id: Uuid,
    step_name: String,
    digest: String,
    body: String,
}

/// Where checkpoints are saved and loaded from
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, run_id: Uuid, step_name: &str, checkpoint: &Checkpoint) -> WorkflowResult<()>;

    /// Latest checkpoint for the run, if any
    async fn load(&self, run_id: Uuid) -> WorkflowResult<Option<Checkpoint>>;
}

fn digest_of(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn encode(run_id: Uuid, step_name: &str, checkpoint: &Checkpoint) -> WorkflowResult<String> {
    let body = serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
    let line = CheckpointLine {
        run_id,
        step_name: step_name.to_string(),
        digest: digest_of(&body),
        body,
    };
    Ok(serde_json::to_string(&line).context("Failed to serialize checkpoint line")?)
}

fn decode(run_id: Uuid, raw: &str) -> WorkflowResult<Checkpoint> {
    let corrupt = |detail: String| WorkflowError::CheckpointCorruption { run_id, detail };

    let line: CheckpointLine =
        serde_json::from_str(raw).map_err(|e| corrupt(format!("unparseable line: {}", e)))?;

    if line.run_id != run_id {
        return Err(corrupt(format!("line belongs to run {}", line.run_id)));
    }

    let actual = digest_of(&line.body);
    if actual != line.digest {
        return Err(corrupt(format!(
            "digest mismatch for step '{}': stored {}, computed {}",
            line.step_name, line.digest, actual
        )));
    }

    serde_json::from_str(&line.body).map_err(|e| corrupt(format!("unparseable body: {}", e)))
}

/// JSONL checkpoint store rooted at the runs directory
pub struct FileCheckpointStore {
    runs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir
            .join(run_id.to_string())
            .join("checkpoints.jsonl")
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run_id: Uuid, step_name: &str, checkpoint: &Checkpoint) -> WorkflowResult<()> {
        let line = encode(run_id, step_name, checkpoint)?;
        let path = self.path_for(run_id);

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create run directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open checkpoint file: {}", path.display()))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .context("Failed to write checkpoint")?;
        file.sync_data().await.context("Failed to sync checkpoint")?;

        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> WorkflowResult<Option<Checkpoint>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read checkpoint file: {}", path.display()))?;

        match raw.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => decode(run_id, last).map(Some),
            None => Ok(None),
        }
    }
}

/// In-memory checkpoint store for tests and embedding
#[derive(Default)]
pub struct MemoryCheckpointStore {
    lines: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, run_id: Uuid) -> usize {
        self.lines
            .lock()
            .await
            .get(&run_id)
            .map_or(0, |lines| lines.len())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, run_id: Uuid, step_name: &str, checkpoint: &Checkpoint) -> WorkflowResult<()> {
        let line = encode(run_id, step_name, checkpoint)?;
        self.lines.lock().await.entry(run_id).or_default().push(line);
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> WorkflowResult<Option<Checkpoint>> {
        let lines = self.lines.lock().await;
        match lines.get(&run_id).and_then(|l| l.last()) {
            Some(last) => decode(run_id, last).map(Some),
            None => Ok(None),
        }
    }
}
