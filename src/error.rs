//! Error taxonomy for the workflow engine.
//!
//! Every failure the engine can surface is a [`WorkflowError`] variant. No
//! component substitutes a default value for an error; the only local
//! recovery is bounded retry of [`WorkflowError::is_retryable`] kinds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::safety::SafetyViolation;
use crate::domain::GampCategory;

/// Convenience alias used throughout the engine
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

/// Errors raised by the orchestration engine
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Invalid workflow graph or policy. Fatal at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Classification oracle error: {message}")]
    ClassificationOracle {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("Generation oracle error: {message}")]
    GenerationOracle {
        message: String,
        diagnostics: Option<String>,
    },

    /// A step read a key no earlier step wrote
    #[error("Missing context key '{key}' (requested by {requested_by})")]
    MissingContext { key: String, requested_by: String },

    #[error("Context conflict on '{key}': expected version {expected:?}, found {actual:?}")]
    ContextConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Ambiguous categorization: top {top:.2} vs second {second:.2} (gap {gap:.2})")]
    AmbiguityDetected { top: f64, second: f64, gap: f64 },

    #[error("Confidence {confidence:.2} for {category} is below floor {floor:.2}")]
    LowConfidence {
        category: GampCategory,
        confidence: f64,
        floor: f64,
    },

    #[error("Insufficient agent responses: {received} of {required} required ({failures} failed)")]
    InsufficientAgentResponses {
        received: usize,
        required: usize,
        failures: usize,
    },

    #[error("Consultation {consultation_id} timed out after {waited:?}")]
    ConsultationTimeout {
        consultation_id: Uuid,
        waited: Duration,
    },

    #[error("Consultation {consultation_id} rejected by {actor}: {reason}")]
    ConsultationRejected {
        consultation_id: Uuid,
        actor: String,
        reason: String,
    },

    #[error("Bypass not permitted: {0}")]
    BypassNotPermitted(String),

    #[error("Invalid consultation transition: {from} -> {to}")]
    InvalidGateTransition { from: String, to: String },

    #[error("Checkpoint corrupted for run {run_id}: {detail}")]
    CheckpointCorruption { run_id: Uuid, detail: String },

    #[error("Step '{step}' timed out after {after:?}")]
    StepTimeout { step: String, after: Duration },

    /// Nothing runnable, nothing pending, and no terminal event
    #[error("Workflow stalled: {0}")]
    WorkflowStalled(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run timed out after {0:?}")]
    RunTimeout(Duration),

    /// I/O failures, rate limits, unreachable subprocesses
    #[error("Transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn classification(message: impl Into<String>) -> Self {
        Self::ClassificationOracle {
            message: message.into(),
            diagnostics: None,
        }
    }

    /// Only transient failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Recoverable outcomes route to consultation or retry instead of aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AmbiguityDetected { .. }
                | Self::LowConfidence { .. }
                | Self::InsufficientAgentResponses { .. }
                | Self::Transient { .. }
        )
    }

    /// Stable snake_case code used in audit records and failure reports
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::ClassificationOracle { .. } => "classification_oracle_error",
            Self::GenerationOracle { .. } => "generation_oracle_error",
            Self::MissingContext { .. } => "missing_context_error",
            Self::ContextConflict { .. } => "context_conflict",
            Self::AmbiguityDetected { .. } => "ambiguity_detected",
            Self::LowConfidence { .. } => "low_confidence_error",
            Self::InsufficientAgentResponses { .. } => "insufficient_agent_responses",
            Self::ConsultationTimeout { .. } => "consultation_timeout_error",
            Self::ConsultationRejected { .. } => "consultation_rejected",
            Self::BypassNotPermitted(_) => "bypass_not_permitted",
            Self::InvalidGateTransition { .. } => "invalid_gate_transition",
            Self::CheckpointCorruption { .. } => "checkpoint_corruption_error",
            Self::StepTimeout { .. } => "step_timeout",
            Self::WorkflowStalled(_) => "workflow_stalled",
            Self::Cancelled => "cancelled",
            Self::RunTimeout(_) => "run_timeout",
            Self::Transient { .. } => "transient_error",
            Self::Safety(_) => "safety_violation",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Oracle-provided diagnostics, if any were attached
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::ClassificationOracle { diagnostics, .. }
            | Self::GenerationOracle { diagnostics, .. } => diagnostics.as_deref(),
            _ => None,
        }
    }
}

/// Structured report for a run that ended in failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub run_id: Uuid,

    /// Step that raised the error (None for run-level failures)
    pub step: Option<String>,

    /// Stable error code (see [`WorkflowError::code`])
    pub code: String,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,

    /// Summary of the event being processed when the error surfaced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl FailureReport {
    pub fn new(run_id: Uuid, step: Option<String>, error: &WorkflowError) -> Self {
        Self {
            run_id,
            step,
            code: error.code().to_string(),
            message: error.to_string(),
            diagnostics: error.diagnostics().map(str::to_string),
            event: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }
}
