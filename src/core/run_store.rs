//! Per-run directory with file-based persistence.
//!
//! Layout under `$GAMPFLOW_HOME/runs/<run_id>/`:
//! - `events.jsonl`: every workflow event, in production order
//! - `audit.jsonl`: the run's audit records
//! - `context.json`: the committed context store
//! - `checkpoints.jsonl`: step checkpoints
//! - `run.json`: persisted run state
//! - `decisions/`: human-decision inbox

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Event, EventKind, RunRecord};

/// File-based storage for one run
pub struct RunStore {
    run_id: Uuid,

    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Serializes event appends from concurrent steps
    write_lock: Mutex<()>,
}

impl RunStore {
    /// Create or open the store for a run under the configured base directory
    pub async fn open(run_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        Self::open_in(&base_dir, run_id).await
    }

    /// Create or open the store for a run under an explicit base directory
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());
        let decisions_dir = run_dir.join("decisions");

        fs::create_dir_all(&decisions_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_id,
            run_dir,
            events_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the base directory for all runs (~/.gampflow/runs or $GAMPFLOW_HOME/runs)
    pub fn base_directory() -> Result<PathBuf> {
        crate::config::runs_dir()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn audit_path(&self) -> PathBuf {
        self.run_dir.join("audit.jsonl")
    }

    pub fn context_path(&self) -> PathBuf {
        self.run_dir.join("context.json")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.run_dir.join("checkpoints.jsonl")
    }

    pub fn record_path(&self) -> PathBuf {
        self.run_dir.join("run.json")
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.run_dir.join("decisions")
    }

    /// Append an event to the log
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay_events(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific kind
    pub async fn last_event_of_kind(&self, kind: EventKind) -> Result<Option<Event>> {
        let events = self.replay_events().await?;
        Ok(events.into_iter().rev().find(|e| e.kind() == kind))
    }

    /// Write the persisted run state (temp file + rename)
    pub async fn save_record(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record).context("Failed to serialize run record")?;
        let path = self.record_path();
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write run record: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to commit run record: {}", path.display()))?;

        Ok(())
    }

    /// Load the persisted run state, if one was written
    pub async fn load_record(&self) -> Result<Option<RunRecord>> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run record: {}", path.display()))?;
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse run record: {}", path.display()))?;

        Ok(Some(record))
    }

    /// List all run IDs under a base directory
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Content fingerprint (first 16 hex chars of SHA256)
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventPayload, WorkflowRun};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn ingested(run_id: Uuid, sequence: u64) -> Event {
        Event::new(
            run_id,
            sequence,
            Some("ingestion".to_string()),
            EventPayload::DocumentIngested {
                fingerprint: format!("fp{}", sequence),
                size_bytes: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_event_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = RunStore::open_in(temp.path(), run_id).await.unwrap();

        for i in 0..5 {
            store.append_event(&ingested(run_id, i)).await.unwrap();
        }

        let events = store.replay_events().await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64);
        }

        let last = store
            .last_event_of_kind(EventKind::DocumentIngested)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.sequence, 4);
    }

    #[tokio::test]
    async fn test_record_round_trip_and_listing() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = RunStore::open_in(temp.path(), run_id).await.unwrap();

        assert!(store.load_record().await.unwrap().is_none());

        let run = WorkflowRun::new(run_id);
        store
            .save_record(&run.to_record(BTreeMap::new(), "memory"))
            .await
            .unwrap();

        let loaded = store.load_record().await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run_id);
        assert_eq!(loaded.audit_ref, "memory");

        let runs = RunStore::list_runs_in(temp.path()).await.unwrap();
        assert_eq!(runs, vec![run_id]);
    }

    #[test]
    fn test_fingerprint_consistency() {
        let a = fingerprint("user requirements");
        let b = fingerprint("user requirements");
        let c = fingerprint("functional spec");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
