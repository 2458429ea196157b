//! Workflow run state.
//!
//! A run is created at ingestion and ends in exactly one terminal status.
//! The persisted form ([`RunRecord`]) is what `status` reads back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventKind};
use crate::core::context::ContextEntry;
use crate::error::FailureReport;

/// Status of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Constructed, not yet started
    Created,

    Running,

    Completed,

    Failed { report: FailureReport },

    /// Cancelled or timed out; committed writes are retained
    Aborted { reason: String },
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Aborted { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// One line of the run's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub event_id: Uuid,
    pub sequence: u64,
    pub kind: EventKind,
    pub produced_by: Option<String>,

    /// Step that consumed the event, once it has been claimed
    pub consumed_by: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.id,
            sequence: event.sequence,
            kind: event.kind(),
            produced_by: event.produced_by.clone(),
            consumed_by: None,
            timestamp: event.timestamp,
        }
    }
}

/// A workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub status: RunStatus,

    /// Most recently started step
    pub current_step: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    pub event_log: Vec<EventLogEntry>,
}

impl WorkflowRun {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: RunStatus::Created,
            current_step: None,
            started_at: Utc::now(),
            completed_at: None,
            event_log: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Utc::now();
    }

    pub fn record_produced(&mut self, event: &Event) {
        self.event_log.push(EventLogEntry::from_event(event));
    }

    pub fn record_consumed(&mut self, event_id: Uuid, step: &str) {
        if let Some(entry) = self.event_log.iter_mut().find(|e| e.event_id == event_id) {
            entry.consumed_by = Some(step.to_string());
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, RunStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Snapshot the run into its persisted form
    pub fn to_record(
        &self,
        context_snapshot: BTreeMap<String, ContextEntry>,
        audit_ref: impl Into<String>,
    ) -> RunRecord {
        RunRecord {
            run_id: self.id,
            status: self.status.clone(),
            current_step: self.current_step.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            context_snapshot,
            event_log: self.event_log.clone(),
            audit_ref: audit_ref.into(),
        }
    }
}

/// Persisted run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context_snapshot: BTreeMap<String, ContextEntry>,
    pub event_log: Vec<EventLogEntry>,

    /// Where this run's audit records live
    pub audit_ref: String,
}

impl RunRecord {
    pub fn into_run(self) -> WorkflowRun {
        WorkflowRun {
            id: self.run_id,
            status: self.status,
            current_step: self.current_step,
            started_at: self.started_at,
            completed_at: self.completed_at,
            event_log: self.event_log,
        }
    }
}
