//! Audit records.
//!
//! Records are append-only: once written they are never mutated or deleted.
//! Fields are public for reading, but no API in the crate hands out a
//! mutable reference to a stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::category::GampCategory;
use super::consultation::ConsultationReason;
use crate::error::FailureReport;

/// A single immutable audit entry linked to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,

    /// Step or human responsible for the change
    pub actor: String,

    pub entry: AuditEntry,
}

impl AuditRecord {
    pub fn new(run_id: Uuid, actor: impl Into<String>, entry: AuditEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            timestamp: Utc::now(),
            actor: actor.into(),
            entry,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.entry.kind()
    }
}

/// A checkpointed key brought back into the live context on resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoredKey {
    pub key: String,

    /// Version the checkpoint held
    pub checkpoint_version: u64,

    /// Version the key carries after the restore
    pub new_version: u64,
}

/// What an audit record documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    ContextWrite {
        key: String,
        prior_version: Option<u64>,
        new_version: u64,
    },

    /// Keys the live context had lost, restored from a checkpoint
    ContextRestored {
        checkpoint_step: String,
        entries: Vec<RestoredKey>,
    },

    ConsultationTransition {
        consultation_id: Option<Uuid>,
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Written before any downstream step observes a bypassed decision
    ConsultationBypassed {
        consultation_id: Uuid,
        original_reason: ConsultationReason,
        justification: String,
        category: GampCategory,
        confidence: f64,
        /// Always true; a bypass is a controlled-testing action, not a fallback
        not_a_fallback: bool,
    },

    StepFailed {
        step: String,
        code: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },

    RunCompleted { status: String },

    RunFailed { report: FailureReport },

    /// Diagnostic snapshot taken when a run is cancelled or times out
    RunAborted {
        reason: String,
        context_keys: Vec<String>,
        pending_events: Vec<String>,
    },
}

impl AuditEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContextWrite { .. } => "context_write",
            Self::ContextRestored { .. } => "context_restored",
            Self::ConsultationTransition { .. } => "consultation_transition",
            Self::ConsultationBypassed { .. } => "consultation_bypassed",
            Self::StepFailed { .. } => "step_failed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunAborted { .. } => "run_aborted",
        }
    }
}
