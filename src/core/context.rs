//! Persistent per-run context store.
//!
//! The store is the only shared mutable state in a run. All reads and writes
//! go through one lock over the committed map, so a read always observes the
//! latest committed write. When a persistence path is set, every commit
//! rewrites `context.json` atomically (temp file + rename) before the value
//! becomes visible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::audit::AuditSink;
use crate::domain::{AuditEntry, AuditRecord, RestoredKey};
use crate::error::{WorkflowError, WorkflowResult};

/// A committed context value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,

    /// Starts at 1 and increases by one per write to the key
    pub version: u64,

    /// Step that wrote this version
    pub writer: String,

    pub updated_at: DateTime<Utc>,
}

/// Point-in-time copy of every entry
pub type ContextSnapshot = BTreeMap<String, ContextEntry>;

/// Persistent key-value store owned by one run
pub struct ContextStore {
    run_id: Uuid,
    entries: Mutex<ContextSnapshot>,
    persist_path: Option<PathBuf>,

    /// Audit mode is on when a sink is attached
    audit: Option<Arc<dyn AuditSink>>,
}

impl ContextStore {
    /// A store that lives only in memory
    pub fn in_memory(run_id: Uuid) -> Self {
        Self {
            run_id,
            entries: Mutex::new(BTreeMap::new()),
            persist_path: None,
            audit: None,
        }
    }

    /// Open a persistent store, loading any previously committed entries
    pub async fn open(run_id: Uuid, path: impl Into<PathBuf>) -> WorkflowResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read context store: {}", path.display()))?;
            serde_json::from_str(&raw).map_err(|e| WorkflowError::CheckpointCorruption {
                run_id,
                detail: format!("context store {} is unreadable: {}", path.display(), e),
            })?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create context directory: {}", parent.display())
                })?;
            }
            BTreeMap::new()
        };

        Ok(Self {
            run_id,
            entries: Mutex::new(entries),
            persist_path: Some(path),
            audit: None,
        })
    }

    /// Turn on audit mode: every write emits a `ContextWrite` record
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Read a committed entry. A missing key is an error, never a placeholder.
    pub async fn get(&self, key: &str, reader: &str) -> WorkflowResult<ContextEntry> {
        self.entries
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| WorkflowError::MissingContext {
                key: key.to_string(),
                requested_by: reader.to_string(),
            })
    }

    /// Read a committed entry if present
    pub async fn try_get(&self, key: &str) -> Option<ContextEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Read a value, falling back to a default the caller supplies explicitly
    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.try_get(key).await.map(|e| e.value).unwrap_or(default)
    }

    /// Read and deserialize a value
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str, reader: &str) -> WorkflowResult<T> {
        let entry = self.get(key, reader).await?;
        serde_json::from_value(entry.value).map_err(|e| {
            WorkflowError::Storage(anyhow::anyhow!(
                "Context key '{}' (v{}, written by {}) does not match the type {} expects: {}",
                key,
                entry.version,
                entry.writer,
                reader,
                e
            ))
        })
    }

    /// Unconditionally write a value. Returns the new version.
    pub async fn set(&self, key: &str, value: Value, writer: &str) -> WorkflowResult<u64> {
        let mut entries = self.entries.lock().await;
        self.commit(&mut entries, key, value, writer).await
    }

    /// Serialize and write a value
    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T, writer: &str) -> WorkflowResult<u64> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize context value for '{}'", key))?;
        self.set(key, value, writer).await
    }

    /// Write only if the key is still at `expected` (None = must not exist)
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
        writer: &str,
    ) -> WorkflowResult<u64> {
        let mut entries = self.entries.lock().await;
        let actual = entries.get(key).map(|e| e.version);
        if actual != expected {
            return Err(WorkflowError::ContextConflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        self.commit(&mut entries, key, value, writer).await
    }

    /// Atomic read-modify-write. `f` sees the current value (if any) and
    /// returns the replacement; no other write can interleave.
    pub async fn edit<F>(&self, key: &str, writer: &str, f: F) -> WorkflowResult<u64>
    where
        F: FnOnce(Option<&Value>) -> WorkflowResult<Value>,
    {
        let mut entries = self.entries.lock().await;
        let next = f(entries.get(key).map(|e| &e.value))?;
        self.commit(&mut entries, key, next, writer).await
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        self.entries.lock().await.clone()
    }

    /// Entries written after `before` was taken
    pub async fn diff_since(&self, before: &ContextSnapshot) -> Vec<ContextEntry> {
        let entries = self.entries.lock().await;
        diff(before, &entries)
    }

    /// Bring back checkpointed keys the live store no longer holds (resume
    /// only). Keys already present keep their committed value. A restored
    /// key whose audit trail already went past the checkpoint is recommitted
    /// one above `audited`, so no version number repeats.
    pub async fn restore_missing(
        &self,
        snapshot: ContextSnapshot,
        audited: &BTreeMap<String, u64>,
    ) -> WorkflowResult<Vec<RestoredKey>> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        let mut restored = Vec::new();

        for (key, mut entry) in snapshot {
            if next.contains_key(&key) {
                continue;
            }
            let checkpoint_version = entry.version;
            if let Some(&last) = audited.get(&key) {
                if last > checkpoint_version {
                    entry.version = last + 1;
                    entry.updated_at = Utc::now();
                }
            }
            restored.push(RestoredKey {
                key: key.clone(),
                checkpoint_version,
                new_version: entry.version,
            });
            next.insert(key, entry);
        }

        if !restored.is_empty() {
            self.persist(&next).await?;
            *entries = next;
            debug!(run_id = %self.run_id, keys = restored.len(), "Context keys restored from checkpoint");
        }
        Ok(restored)
    }

    async fn commit(
        &self,
        entries: &mut ContextSnapshot,
        key: &str,
        value: Value,
        writer: &str,
    ) -> WorkflowResult<u64> {
        let prior_version = entries.get(key).map(|e| e.version);
        let new_version = prior_version.map_or(1, |v| v + 1);

        let entry = ContextEntry {
            key: key.to_string(),
            value,
            version: new_version,
            writer: writer.to_string(),
            updated_at: Utc::now(),
        };

        if self.persist_path.is_some() {
            let mut next = entries.clone();
            next.insert(key.to_string(), entry.clone());
            self.persist(&next).await?;
            *entries = next;
        } else {
            entries.insert(key.to_string(), entry);
        }

        if let Some(ref sink) = self.audit {
            let record = AuditRecord::new(
                self.run_id,
                writer,
                AuditEntry::ContextWrite {
                    key: key.to_string(),
                    prior_version,
                    new_version,
                },
            );
            sink.append(&record).await?;
        }

        debug!(run_id = %self.run_id, key, version = new_version, writer, "Context write committed");
        Ok(new_version)
    }

    async fn persist(&self, entries: &ContextSnapshot) -> WorkflowResult<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(entries).context("Failed to serialize context store")?;
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write context store: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("Failed to commit context store: {}", path.display()))?;

        Ok(())
    }
}

/// Entries in `after` that are new or have a different version than in `before`
pub fn diff(before: &ContextSnapshot, after: &ContextSnapshot) -> Vec<ContextEntry> {
    after
        .values()
        .filter(|entry| {
            before
                .get(&entry.key)
                .map_or(true, |prior| prior.version != entry.version)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::MemoryAuditLog;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let store = ContextStore::in_memory(Uuid::new_v4());

        let result = store.get("plan", "generation").await;
        match result {
            Err(WorkflowError::MissingContext { key, requested_by }) => {
                assert_eq!(key, "plan");
                assert_eq!(requested_by, "generation");
            }
            other => panic!("expected MissingContext, got {:?}", other),
        }

        // The only defaulting read is the explicit one
        assert_eq!(store.get_or("plan", json!(null)).await, json!(null));
    }

    #[tokio::test]
    async fn test_versions_increment_per_key() {
        let store = ContextStore::in_memory(Uuid::new_v4());

        assert_eq!(store.set("a", json!(1), "s1").await.unwrap(), 1);
        assert_eq!(store.set("a", json!(2), "s2").await.unwrap(), 2);
        assert_eq!(store.set("b", json!(3), "s2").await.unwrap(), 1);

        let entry = store.get("a", "test").await.unwrap();
        assert_eq!(entry.value, json!(2));
        assert_eq!(entry.writer, "s2");
    }

    #[tokio::test]
    async fn test_compare_and_set_detects_conflict() {
        let store = ContextStore::in_memory(Uuid::new_v4());

        store.compare_and_set("gate", None, json!("evaluating"), "gate").await.unwrap();

        let stale = store.compare_and_set("gate", None, json!("required"), "gate").await;
        assert!(matches!(
            stale,
            Err(WorkflowError::ContextConflict { expected: None, actual: Some(1), .. })
        ));

        let version = store
            .compare_and_set("gate", Some(1), json!("required"), "gate")
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_edits_are_serialized() {
        let store = Arc::new(ContextStore::in_memory(Uuid::new_v4()));
        store.set("counter", json!(0), "init").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .edit("counter", &format!("w{}", i), |current| {
                        let n = current.and_then(Value::as_u64).unwrap_or(0);
                        Ok(json!(n + 1))
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entry = store.get("counter", "test").await.unwrap();
        assert_eq!(entry.value, json!(20));
        assert_eq!(entry.version, 21);
    }

    #[tokio::test]
    async fn test_writes_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let path = temp.path().join("context.json");

        {
            let store = ContextStore::open(run_id, &path).await.unwrap();
            store.set("document", json!({"name": "urs"}), "ingestion").await.unwrap();
        }

        let reopened = ContextStore::open(run_id, &path).await.unwrap();
        let entry = reopened.get("document", "categorization").await.unwrap();
        assert_eq!(entry.value, json!({"name": "urs"}));
        assert_eq!(entry.writer, "ingestion");
    }

    #[tokio::test]
    async fn test_corrupted_store_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("context.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = ContextStore::open(Uuid::new_v4(), &path).await;
        assert!(matches!(result, Err(WorkflowError::CheckpointCorruption { .. })));
    }

    #[tokio::test]
    async fn test_audit_mode_records_every_write() {
        let sink = Arc::new(MemoryAuditLog::new());
        let run_id = Uuid::new_v4();
        let store = ContextStore::in_memory(run_id).with_audit(sink.clone());

        store.set("plan", json!("v1"), "planning").await.unwrap();
        store.set("plan", json!("v2"), "planning").await.unwrap();

        let records = sink.records_for_run(run_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].entry,
            AuditEntry::ContextWrite {
                key: "plan".into(),
                prior_version: Some(1),
                new_version: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_diff_since_snapshot() {
        let store = ContextStore::in_memory(Uuid::new_v4());
        store.set("a", json!(1), "s1").await.unwrap();
        let before = store.snapshot().await;

        store.set("a", json!(2), "s2").await.unwrap();
        store.set("b", json!(1), "s2").await.unwrap();

        let changed = store.diff_since(&before).await;
        let keys: Vec<&str> = changed.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_restore_keeps_committed_writes() {
        let store = ContextStore::in_memory(Uuid::new_v4());
        store.set("document", json!("urs"), "ingestion").await.unwrap();
        let checkpoint = store.snapshot().await;

        // Committed after the checkpoint was taken
        store.set("document", json!("urs-rev-b"), "ingestion").await.unwrap();
        store.set("gate", json!("resolved"), "human_review").await.unwrap();

        let restored = store.restore_missing(checkpoint, &BTreeMap::new()).await.unwrap();
        assert!(restored.is_empty());

        let document = store.get("document", "test").await.unwrap();
        assert_eq!(document.value, json!("urs-rev-b"));
        assert_eq!(document.version, 2);
        assert_eq!(store.get("gate", "test").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_restore_fills_lost_keys_above_audited_versions() {
        let source = ContextStore::in_memory(Uuid::new_v4());
        source.set("document", json!("urs"), "ingestion").await.unwrap();
        source.set("plan", json!("cat4"), "planning").await.unwrap();
        let checkpoint = source.snapshot().await;

        let fresh = ContextStore::in_memory(Uuid::new_v4());
        // plan reached v3 in the audit trail before the live copy was lost
        let audited = BTreeMap::from([("document".to_string(), 1), ("plan".to_string(), 3)]);
        let restored = fresh.restore_missing(checkpoint, &audited).await.unwrap();

        assert_eq!(
            restored,
            vec![
                RestoredKey {
                    key: "document".into(),
                    checkpoint_version: 1,
                    new_version: 1,
                },
                RestoredKey {
                    key: "plan".into(),
                    checkpoint_version: 1,
                    new_version: 4,
                },
            ]
        );

        let plan = fresh.get("plan", "test").await.unwrap();
        assert_eq!(plan.value, json!("cat4"));
        assert_eq!(fresh.set("plan", json!("cat5"), "planning").await.unwrap(), 5);
    }
}
