//! Core workflow engine.
//!
//! This module contains:
//! - Scheduler: Event routing, fan-in collection, timeouts, checkpointing
//! - Context: Shared key-value state with per-key versions
//! - Categorization: Scoring and ambiguity detection
//! - Consultation: The human-review gate and its state machine
//! - Coordinator: Bounded fan-out to specialist agents
//! - Steps and Orchestrator: The GAMP categorization workflow
//! - Audit, RunStore, Checkpoint: Durable run state
//! - Safety and Retry: Limits and transient-failure handling

pub mod audit;
pub mod categorization;
pub mod checkpoint;
pub mod consultation;
pub mod context;
pub mod coordinator;
pub mod orchestrator;
pub mod retry;
pub mod run_store;
pub mod safety;
pub mod scheduler;
pub mod steps;

// Re-export commonly used types
pub use audit::{AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use categorization::{CategorizationEngine, CategorizationPolicy};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use consultation::{ConsultationGate, ConsultationPolicy, GateRecord, GateState, ValidationMode};
pub use context::{ContextEntry, ContextSnapshot, ContextStore};
pub use coordinator::{AgentCoordinator, CoordinatorConfig};
pub use orchestrator::{RunHistory, WorkflowOrchestrator};
pub use retry::RetryPolicy;
pub use run_store::RunStore;
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
pub use scheduler::{Consumes, Step, StepContext, StepContract, StepInput, StepScheduler, WorkflowGraph};
