//! Adapter interfaces for external systems.
//!
//! The engine talks to four kinds of collaborators:
//! - a classifier oracle that reports GAMP category signals
//! - a generator oracle that produces the final artifact
//! - specialist agents that answer fan-out requests
//! - a human-decision source for pending consultations
//!
//! [`CommandOracle`] implements the oracle and agent traits over a
//! subprocess JSON protocol; [`DecisionInbox`] implements the decision
//! source over a per-run directory of decision files.

pub mod command;
pub mod decision_inbox;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{
    AgentRequest, ClassifierResponse, ConsultationRequest, Document, GeneratedArtifact,
    GenerationContext, HumanDecision,
};
use crate::error::WorkflowResult;

pub use command::CommandOracle;
pub use decision_inbox::DecisionInbox;

/// Reports per-category signals and a confidence for a document
#[async_trait]
pub trait ClassifierOracle: Send + Sync {
    /// Unreachable or malformed responses must fail; never return a default
    async fn classify(&self, document: &Document) -> WorkflowResult<ClassifierResponse>;
}

/// Produces the validation artifact from the accumulated run context
#[async_trait]
pub trait GeneratorOracle: Send + Sync {
    async fn generate(&self, context: &GenerationContext) -> WorkflowResult<GeneratedArtifact>;
}

/// A specialist consulted during coordination
#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    fn id(&self) -> &str;

    /// Response payload for one request
    async fn invoke(&self, request: &AgentRequest) -> WorkflowResult<Value>;
}

/// Where human consultation decisions come from
#[async_trait]
pub trait HumanDecisionSource: Send + Sync {
    /// Wait until a decision for `request` is available. Callers bound the
    /// wait with the consultation timeout.
    async fn await_decision(&self, request: &ConsultationRequest) -> WorkflowResult<HumanDecision>;
}
