//! Domain types for the workflow engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable facts routed by the scheduler
//! - Run: Workflow run state and its persisted form
//! - Category: GAMP categories, classifier signals, categorization results
//! - Consultation: Human-review requests and decisions
//! - Agent: Specialist agent requests and outcomes
//! - Audit: Append-only audit records
//! - Artifact: Documents in, generated artifacts out

pub mod agent;
pub mod artifact;
pub mod audit;
pub mod category;
pub mod consultation;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use agent::{AgentOutcome, AgentRequest, AgentResponse, AgentStatus, AggregatedResponses};
pub use artifact::{Document, GeneratedArtifact, GenerationContext, ValidationPlan};
pub use audit::{AuditEntry, AuditRecord, RestoredKey};
pub use category::{CategorizationResult, ClassifierResponse, GampCategory, SignalCounts};
pub use consultation::{
    ConsultationDecision, ConsultationReason, ConsultationRequest, DecisionOutcome,
    HumanDecision, HumanVerdict, Urgency,
};
pub use events::{Event, EventKind, EventPayload};
pub use run::{EventLogEntry, RunRecord, RunStatus, WorkflowRun};
