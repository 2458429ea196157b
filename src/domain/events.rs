//! Workflow events.
//!
//! Events are immutable facts. The payload is a closed enum, so every
//! consumer matches exhaustively and the scheduler can reason about the
//! workflow graph through [`EventKind`] alone.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::{AgentOutcome, AggregatedResponses};
use super::artifact::{Document, GeneratedArtifact, ValidationPlan};
use super::category::CategorizationResult;
use super::consultation::{ConsultationDecision, ConsultationRequest};

/// A single event flowing through the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// The run (session) this event belongs to
    pub correlation_id: Uuid,

    /// Position in the run's event log
    pub sequence: u64,

    /// Step that produced the event (None for the start event and
    /// scheduler-generated events)
    pub produced_by: Option<String>,

    pub timestamp: DateTime<Utc>,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        correlation_id: Uuid,
        sequence: u64,
        produced_by: Option<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            sequence,
            produced_by,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Short human-readable description (no document content)
    pub fn summary(&self) -> String {
        format!(
            "#{} {} from {}",
            self.sequence,
            self.kind(),
            self.produced_by.as_deref().unwrap_or("scheduler")
        )
    }
}

/// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Injected by the scheduler to start a run
    WorkflowStarted { document: Document },

    DocumentIngested { fingerprint: String, size_bytes: u64 },

    Categorized { result: CategorizationResult },

    ConsultationRequired { request: ConsultationRequest },

    ConsultationCleared { decision: ConsultationDecision },

    PlanReady { plan: ValidationPlan },

    AgentResponded { outcome: AgentOutcome },

    AgentsAggregated { aggregated: AggregatedResponses },

    ArtifactGenerated { artifact: GeneratedArtifact },

    /// Terminal event
    WorkflowCompleted { summary: String },

    /// Produced by the scheduler when a step exceeds its timeout
    StepTimedOut { step: String, timeout_ms: u64 },

    /// Produced by the scheduler when a step fails permanently
    StepFailed { step: String, code: String, error: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Self::DocumentIngested { .. } => EventKind::DocumentIngested,
            Self::Categorized { .. } => EventKind::Categorized,
            Self::ConsultationRequired { .. } => EventKind::ConsultationRequired,
            Self::ConsultationCleared { .. } => EventKind::ConsultationCleared,
            Self::PlanReady { .. } => EventKind::PlanReady,
            Self::AgentResponded { .. } => EventKind::AgentResponded,
            Self::AgentsAggregated { .. } => EventKind::AgentsAggregated,
            Self::ArtifactGenerated { .. } => EventKind::ArtifactGenerated,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::StepTimedOut { .. } => EventKind::StepTimedOut,
            Self::StepFailed { .. } => EventKind::StepFailed,
        }
    }
}

/// Discriminant of [`EventPayload`], used in step contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    DocumentIngested,
    Categorized,
    ConsultationRequired,
    ConsultationCleared,
    PlanReady,
    AgentResponded,
    AgentsAggregated,
    ArtifactGenerated,
    WorkflowCompleted,
    StepTimedOut,
    StepFailed,
}

impl EventKind {
    /// The kind that starts every run
    pub const START: EventKind = EventKind::WorkflowStarted;

    /// The kind that completes a run
    pub const TERMINAL: EventKind = EventKind::WorkflowCompleted;

    /// Kinds the scheduler itself produces
    pub fn is_system(self) -> bool {
        matches!(self, Self::StepTimedOut | Self::StepFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::DocumentIngested => "document_ingested",
            Self::Categorized => "categorized",
            Self::ConsultationRequired => "consultation_required",
            Self::ConsultationCleared => "consultation_cleared",
            Self::PlanReady => "plan_ready",
            Self::AgentResponded => "agent_responded",
            Self::AgentsAggregated => "agents_aggregated",
            Self::ArtifactGenerated => "artifact_generated",
            Self::WorkflowCompleted => "workflow_completed",
            Self::StepTimedOut => "step_timed_out",
            Self::StepFailed => "step_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            3,
            Some("completion".to_string()),
            EventPayload::WorkflowCompleted {
                summary: "done".to_string(),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"workflow_completed\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), EventKind::WorkflowCompleted);
        assert_eq!(parsed.sequence, 3);
    }

    #[test]
    fn test_system_kinds() {
        assert!(EventKind::StepTimedOut.is_system());
        assert!(EventKind::StepFailed.is_system());
        assert!(!EventKind::TERMINAL.is_system());
    }

    #[test]
    fn test_summary_names_producer() {
        let event = Event::new(
            Uuid::new_v4(),
            0,
            None,
            EventPayload::StepTimedOut {
                step: "planning".into(),
                timeout_ms: 10,
            },
        );
        assert_eq!(event.summary(), "#0 step_timed_out from scheduler");
    }
}
