//! Append-only audit sinks.
//!
//! Records are stored as newline-delimited JSON (JSONL), one record per line,
//! and are never rewritten. Queries replay the file and filter.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::AuditRecord;

/// Durable, append-only destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a record. Returns only once the record is durable.
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// All records for a run, in append order
    async fn records_for_run(&self, run_id: Uuid) -> Result<Vec<AuditRecord>>;

    /// Records for a run written at or after `since`
    async fn records_since(&self, run_id: Uuid, since: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        let records = self.records_for_run(run_id).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.timestamp >= since)
            .collect())
    }

    /// Reference stored in the persisted run state
    fn location(&self) -> String;
}

/// File-based audit log using JSONL format
pub struct JsonlAuditLog {
    path: PathBuf,

    /// Serializes appends from concurrent steps
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    /// Open (or create on first append) an audit log at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay every record in the log
    pub async fn replay(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse audit record: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize audit record")?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write audit record")?;
        file.sync_data().await.context("Failed to sync audit log")?;

        Ok(())
    }

    async fn records_for_run(&self, run_id: Uuid) -> Result<Vec<AuditRecord>> {
        let records = self.replay().await?;
        Ok(records.into_iter().filter(|r| r.run_id == run_id).collect())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory audit sink for tests and embedding
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record appended so far
    pub async fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn records_for_run(&self, run_id: Uuid) -> Result<Vec<AuditRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuditEntry;
    use tempfile::TempDir;

    fn context_write(run_id: Uuid, key: &str, version: u64) -> AuditRecord {
        AuditRecord::new(
            run_id,
            "ingestion",
            AuditEntry::ContextWrite {
                key: key.to_string(),
                prior_version: version.checked_sub(1),
                new_version: version,
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_query_by_run() {
        let temp = TempDir::new().unwrap();
        let log = JsonlAuditLog::open(temp.path().join("audit.jsonl"))
            .await
            .unwrap();

        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        log.append(&context_write(run_a, "document", 1)).await.unwrap();
        log.append(&context_write(run_b, "document", 1)).await.unwrap();
        log.append(&context_write(run_a, "plan", 1)).await.unwrap();

        let records = log.records_for_run(run_a).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind(), "context_write");
        assert!(records.iter().all(|r| r.run_id == run_a));

        assert_eq!(log.replay().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_records_since_filters_by_timestamp() {
        let log = MemoryAuditLog::new();
        let run_id = Uuid::new_v4();

        log.append(&context_write(run_id, "document", 1)).await.unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        log.append(&context_write(run_id, "plan", 1)).await.unwrap();

        let recent = log.records_since(run_id, cutoff).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_of_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let log = JsonlAuditLog::open(temp.path().join("nested").join("audit.jsonl"))
            .await
            .unwrap();
        assert!(log.replay().await.unwrap().is_empty());
    }
}
