//! The steps of the GAMP categorization workflow.
//!
//! ```text
//! ingestion -> categorization -> consultation_gate -+-> planning -> coordination
//!                                      |            |                  |
//!                                      +-> human_review                | AgentResponded xK
//!                                                                      v
//!               completion <- generation <- aggregation (collect K) <--+
//! ```
//!
//! Steps communicate through events and the run's context store. Every
//! context key a step writes is declared in its contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::categorization::CategorizationEngine;
use super::consultation::{ConsultationGate, ConsultationPolicy, GateRecord, GateState};
use super::coordinator::AgentCoordinator;
use super::run_store::fingerprint;
use super::safety::SafetyLimits;
use super::scheduler::{Step, StepContext, StepContract, StepInput};
use crate::adapters::{ClassifierOracle, GeneratorOracle, HumanDecisionSource};
use crate::domain::{
    AggregatedResponses, CategorizationResult, ConsultationDecision, Document, EventKind,
    EventPayload, GeneratedArtifact, GenerationContext, ValidationPlan,
};
use crate::error::{WorkflowError, WorkflowResult};

pub const KEY_DOCUMENT: &str = "document";
pub const KEY_CATEGORIZATION: &str = "categorization";
pub const KEY_GATE: &str = "consultation.gate";
pub const KEY_DECISION: &str = "consultation.decision";
pub const KEY_PLAN: &str = "plan";
pub const KEY_AGENT_RESULTS: &str = "agent_results";
pub const KEY_ARTIFACT: &str = "artifact";

/// Headroom on top of inner deadlines so the inner timeout fires first
const DEADLINE_MARGIN: Duration = Duration::from_secs(30);

fn unexpected(step: &str, input: &StepInput) -> WorkflowError {
    WorkflowError::Configuration(format!("step '{}' received unexpected input {}", step, input.summary()))
}

/// Validates the submitted document and records it in context
pub struct IngestionStep {
    limits: SafetyLimits,
}

impl IngestionStep {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl Step for IngestionStep {
    fn name(&self) -> &str {
        "ingestion"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::WorkflowStarted)
            .produces(EventKind::DocumentIngested)
            .writes(KEY_DOCUMENT)
    }

    async fn execute(&self, ctx: &StepContext, input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let document = match input {
            StepInput::Event(ref event) => match event.payload {
                EventPayload::WorkflowStarted { ref document } => document.clone(),
                _ => return Err(unexpected(self.name(), &input)),
            },
            _ => return Err(unexpected(self.name(), &input)),
        };

        self.limits
            .validate_document(&document.content, document.source_path.as_deref())?;
        if document.content.trim().is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "document '{}' is empty",
                document.name
            )));
        }

        let fingerprint = fingerprint(&document.content);
        let size_bytes = document.size_bytes();
        ctx.set(KEY_DOCUMENT, &document).await?;

        info!(document = %document.name, %fingerprint, size_bytes, "Document ingested");
        Ok(vec![EventPayload::DocumentIngested {
            fingerprint,
            size_bytes,
        }])
    }
}

/// Asks the classifier oracle and derives the categorization result
pub struct CategorizationStep {
    classifier: Arc<dyn ClassifierOracle>,
    engine: CategorizationEngine,
}

impl CategorizationStep {
    pub fn new(classifier: Arc<dyn ClassifierOracle>, engine: CategorizationEngine) -> Self {
        Self { classifier, engine }
    }
}

#[async_trait]
impl Step for CategorizationStep {
    fn name(&self) -> &str {
        "categorization"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::DocumentIngested)
            .produces(EventKind::Categorized)
            .writes(KEY_CATEGORIZATION)
    }

    async fn execute(&self, ctx: &StepContext, _input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let document: Document = ctx.get(KEY_DOCUMENT).await?;
        let response = ctx.suspend(self.classifier.classify(&document)).await??;
        let result = self.engine.categorize(&response)?;

        // Low confidence and ambiguity are routed by the consultation gate
        if let Err(concern) = self.engine.assess(&result) {
            warn!(code = concern.code(), concern = %concern, "Categorization needs review");
        }

        ctx.set(KEY_CATEGORIZATION, &result).await?;
        info!(
            category = result.predicted.number(),
            confidence = result.confidence,
            ambiguous = result.ambiguous,
            "Document categorized"
        );
        Ok(vec![EventPayload::Categorized { result }])
    }
}

/// Decides whether the categorization needs a human
pub struct ConsultationGateStep {
    policy: ConsultationPolicy,
    confidence_floor: f64,
}

impl ConsultationGateStep {
    pub fn new(policy: ConsultationPolicy, confidence_floor: f64) -> Self {
        Self {
            policy,
            confidence_floor,
        }
    }
}

#[async_trait]
impl Step for ConsultationGateStep {
    fn name(&self) -> &str {
        "consultation_gate"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::Categorized)
            .produces(EventKind::ConsultationCleared)
            .produces(EventKind::ConsultationRequired)
            .writes(KEY_GATE)
            .writes(KEY_DECISION)
    }

    async fn execute(&self, ctx: &StepContext, input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let result: CategorizationResult = match input {
            StepInput::Event(ref event) => match event.payload {
                EventPayload::Categorized { ref result } => result.clone(),
                _ => return Err(unexpected(self.name(), &input)),
            },
            _ => return Err(unexpected(self.name(), &input)),
        };

        let gate = ConsultationGate::new(
            ctx.run_id,
            self.policy.clone(),
            self.confidence_floor,
            Arc::clone(&ctx.audit),
        );
        let mut record = gate.evaluate(result, self.name()).await?;
        if record.state == GateState::Required {
            gate.route(&mut record, self.name()).await?;
        }
        ctx.set(KEY_GATE, &record).await?;

        if let Some(decision) = record.decision {
            ctx.set(KEY_DECISION, &decision).await?;
            return Ok(vec![EventPayload::ConsultationCleared { decision }]);
        }

        match record.request {
            Some(request) => Ok(vec![EventPayload::ConsultationRequired { request }]),
            None => Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: GateState::AwaitingHuman.to_string(),
            }),
        }
    }
}

/// Blocks on a human decision for a pending consultation
pub struct HumanReviewStep {
    policy: ConsultationPolicy,
    confidence_floor: f64,
    source: Arc<dyn HumanDecisionSource>,
}

impl HumanReviewStep {
    pub fn new(
        policy: ConsultationPolicy,
        confidence_floor: f64,
        source: Arc<dyn HumanDecisionSource>,
    ) -> Self {
        Self {
            policy,
            confidence_floor,
            source,
        }
    }
}

#[async_trait]
impl Step for HumanReviewStep {
    fn name(&self) -> &str {
        "human_review"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::ConsultationRequired)
            .produces(EventKind::ConsultationCleared)
            .writes(KEY_GATE)
            .writes(KEY_DECISION)
            .timeout(self.policy.decision_timeout() + DEADLINE_MARGIN)
    }

    async fn execute(&self, ctx: &StepContext, _input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let mut record: GateRecord = ctx.get(KEY_GATE).await?;
        if record.state != GateState::AwaitingHuman {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: GateState::Resolved.to_string(),
            });
        }
        let Some(request) = record.request.clone() else {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: GateState::Resolved.to_string(),
            });
        };

        let gate = ConsultationGate::new(
            ctx.run_id,
            self.policy.clone(),
            self.confidence_floor,
            Arc::clone(&ctx.audit),
        );

        let wait = self.policy.decision_timeout();
        let decision = match ctx
            .suspend(tokio::time::timeout(wait, self.source.await_decision(&request)))
            .await?
        {
            Ok(decision) => decision?,
            Err(_) => return Err(gate.expire(&record, wait).await),
        };

        // Persist the resolved gate even when the verdict fails the run
        let resolved = gate.resolve(&mut record, decision).await;
        ctx.set(KEY_GATE, &record).await?;
        let decision = resolved?;
        ctx.set(KEY_DECISION, &decision).await?;

        Ok(vec![EventPayload::ConsultationCleared { decision }])
    }
}

/// Derives validation rigor from the final category
pub struct PlanningStep {
    agents: Vec<String>,
}

impl PlanningStep {
    pub fn new(agents: Vec<String>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl Step for PlanningStep {
    fn name(&self) -> &str {
        "planning"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::ConsultationCleared)
            .produces(EventKind::PlanReady)
            .writes(KEY_PLAN)
    }

    async fn execute(&self, ctx: &StepContext, _input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let decision: ConsultationDecision = ctx.get(KEY_DECISION).await?;
        let plan = ValidationPlan::for_category(decision.final_category, self.agents.clone());
        ctx.set(KEY_PLAN, &plan).await?;

        info!(
            category = plan.category.number(),
            min_tests = plan.min_tests,
            max_tests = plan.max_tests,
            agents = plan.agents.len(),
            "Validation plan ready"
        );
        Ok(vec![EventPayload::PlanReady { plan }])
    }
}

/// Fans the plan out to specialist agents, one event per outcome
pub struct CoordinationStep {
    coordinator: Arc<AgentCoordinator>,
}

impl CoordinationStep {
    pub fn new(coordinator: Arc<AgentCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Step for CoordinationStep {
    fn name(&self) -> &str {
        "coordination"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::PlanReady)
            .produces(EventKind::AgentResponded)
            .timeout(self.coordinator.config().request_deadline() + DEADLINE_MARGIN)
    }

    async fn execute(&self, ctx: &StepContext, input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let plan = match input {
            StepInput::Event(ref event) => match event.payload {
                EventPayload::PlanReady { ref plan } => plan.clone(),
                _ => return Err(unexpected(self.name(), &input)),
            },
            _ => return Err(unexpected(self.name(), &input)),
        };
        let document: Document = ctx.get(KEY_DOCUMENT).await?;
        let categorization: CategorizationResult = ctx.get(KEY_CATEGORIZATION).await?;

        let payload = json!({
            "document": document.name,
            "category": plan.category,
            "confidence": categorization.confidence,
            "plan": plan,
        });
        let requests = self.coordinator.build_requests(ctx.run_id, &payload);
        let outcomes = self.coordinator.dispatch(requests, &ctx.cancel).await;
        ctx.ensure_active()?;

        Ok(outcomes
            .into_iter()
            .map(|outcome| EventPayload::AgentResponded { outcome })
            .collect())
    }
}

/// Fan-in of agent outcomes through the quorum check
pub struct AggregationStep {
    coordinator: Arc<AgentCoordinator>,
    collect_timeout: Duration,
}

impl AggregationStep {
    pub fn new(coordinator: Arc<AgentCoordinator>, collect_timeout: Duration) -> Self {
        Self {
            coordinator,
            collect_timeout,
        }
    }
}

#[async_trait]
impl Step for AggregationStep {
    fn name(&self) -> &str {
        "aggregation"
    }

    fn contract(&self) -> StepContract {
        StepContract::collect(EventKind::AgentResponded, self.coordinator.fan_out())
            .collect_timeout(self.collect_timeout)
            .produces(EventKind::AgentsAggregated)
            .writes(KEY_AGENT_RESULTS)
    }

    async fn execute(&self, ctx: &StepContext, input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        if let StepInput::CollectionTimedOut { ref received, expected } = input {
            warn!(
                received = received.len(),
                expected, "Aggregating partial agent responses"
            );
        }

        let outcomes = input
            .into_events()
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::AgentResponded { outcome } => Some(outcome),
                _ => None,
            })
            .collect();

        let aggregated: AggregatedResponses = self.coordinator.aggregate(outcomes)?;
        ctx.set(KEY_AGENT_RESULTS, &aggregated).await?;
        Ok(vec![EventPayload::AgentsAggregated { aggregated }])
    }
}

/// Calls the generator oracle with everything the run has learned
pub struct GenerationStep {
    generator: Arc<dyn GeneratorOracle>,
}

impl GenerationStep {
    pub fn new(generator: Arc<dyn GeneratorOracle>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Step for GenerationStep {
    fn name(&self) -> &str {
        "generation"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::AgentsAggregated)
            .produces(EventKind::ArtifactGenerated)
            .writes(KEY_ARTIFACT)
    }

    async fn execute(&self, ctx: &StepContext, _input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let aggregated: AggregatedResponses = ctx.get(KEY_AGENT_RESULTS).await?;
        let context = GenerationContext {
            document: ctx.get(KEY_DOCUMENT).await?,
            categorization: ctx.get(KEY_CATEGORIZATION).await?,
            decision: ctx.get(KEY_DECISION).await?,
            plan: ctx.get(KEY_PLAN).await?,
            agent_responses: aggregated.responses,
        };

        let artifact = ctx.suspend(self.generator.generate(&context)).await??;
        ctx.set(KEY_ARTIFACT, &artifact).await?;

        info!(artifact = %artifact.name, size_bytes = artifact.size_bytes, "Artifact generated");
        Ok(vec![EventPayload::ArtifactGenerated { artifact }])
    }
}

/// Emits the terminal event
pub struct CompletionStep;

#[async_trait]
impl Step for CompletionStep {
    fn name(&self) -> &str {
        "completion"
    }

    fn contract(&self) -> StepContract {
        StepContract::consumes(EventKind::ArtifactGenerated).produces(EventKind::WorkflowCompleted)
    }

    async fn execute(&self, ctx: &StepContext, input: StepInput) -> WorkflowResult<Vec<EventPayload>> {
        let artifact: GeneratedArtifact = match input {
            StepInput::Event(ref event) => match event.payload {
                EventPayload::ArtifactGenerated { ref artifact } => artifact.clone(),
                _ => return Err(unexpected(self.name(), &input)),
            },
            _ => return Err(unexpected(self.name(), &input)),
        };
        let decision: ConsultationDecision = ctx.get(KEY_DECISION).await?;

        let summary = format!(
            "{} generated for {} ({:?} consultation)",
            artifact.name, decision.final_category, decision.outcome
        );
        Ok(vec![EventPayload::WorkflowCompleted { summary }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::{AuditSink, MemoryAuditLog};
    use crate::core::context::ContextStore;
    use crate::core::safety::SafetyViolation;
    use crate::domain::{DecisionOutcome, Event, GampCategory};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn step_context(step: &str) -> StepContext {
        let run_id = Uuid::new_v4();
        let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditLog::new());
        StepContext {
            run_id,
            step: step.to_string(),
            context: Arc::new(ContextStore::in_memory(run_id)),
            audit,
            cancel: CancellationToken::new(),
        }
    }

    fn started(ctx: &StepContext, document: Document) -> StepInput {
        StepInput::Event(Event::new(
            ctx.run_id,
            0,
            None,
            EventPayload::WorkflowStarted { document },
        ))
    }

    #[tokio::test]
    async fn test_ingestion_records_document() {
        let ctx = step_context("ingestion");
        let step = IngestionStep::new(SafetyLimits::default());

        let produced = step
            .execute(&ctx, started(&ctx, Document::new("urs-001", "The system shall...")))
            .await
            .unwrap();

        assert!(matches!(
            produced[0],
            EventPayload::DocumentIngested { size_bytes: 19, .. }
        ));
        let stored: Document = ctx.get(KEY_DOCUMENT).await.unwrap();
        assert_eq!(stored.name, "urs-001");
    }

    #[tokio::test]
    async fn test_ingestion_enforces_safety_limits() {
        let ctx = step_context("ingestion");
        let limits = SafetyLimits {
            max_document_bytes: 8,
            ..Default::default()
        };
        let step = IngestionStep::new(limits);

        let err = step
            .execute(&ctx, started(&ctx, Document::new("urs-001", "far too long for the limit")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Safety(SafetyViolation::MaxDocumentBytes { .. })
        ));
        assert!(ctx.context.try_get(KEY_DOCUMENT).await.is_none());
    }

    #[tokio::test]
    async fn test_ingestion_rejects_empty_document() {
        let ctx = step_context("ingestion");
        let step = IngestionStep::new(SafetyLimits::default());
        let result = step.execute(&ctx, started(&ctx, Document::new("blank", "  \n"))).await;
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_planning_uses_final_category() {
        let ctx = step_context("planning");
        let decision = ConsultationDecision {
            consultation_id: Some(Uuid::new_v4()),
            outcome: DecisionOutcome::Resolved,
            bypass_justification: None,
            verdict: None,
            final_category: GampCategory::Category4,
            actor: "qa-lead".to_string(),
            timestamp: Utc::now(),
        };
        ctx.context
            .set_as(KEY_DECISION, &decision, "human_review")
            .await
            .unwrap();

        let step = PlanningStep::new(vec!["sme".to_string(), "research".to_string()]);
        let input = StepInput::Event(Event::new(
            ctx.run_id,
            4,
            Some("human_review".to_string()),
            EventPayload::ConsultationCleared { decision },
        ));
        let produced = step.execute(&ctx, input).await.unwrap();

        match &produced[0] {
            EventPayload::PlanReady { plan } => {
                assert_eq!(plan.category, GampCategory::Category4);
                assert_eq!((plan.min_tests, plan.max_tests), (15, 20));
                assert_eq!(plan.agents, vec!["sme", "research"]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_planning_without_decision_is_missing_context() {
        let ctx = step_context("planning");
        let step = PlanningStep::new(vec!["sme".to_string()]);
        let input = StepInput::Collected(Vec::new());

        match step.execute(&ctx, input).await {
            Err(WorkflowError::MissingContext { key, requested_by }) => {
                assert_eq!(key, KEY_DECISION);
                assert_eq!(requested_by, "planning");
            }
            other => panic!("expected missing context, got {:?}", other),
        }
    }

    #[test]
    fn test_gate_steps_share_write_keys() {
        let gate = ConsultationGateStep::new(ConsultationPolicy::default(), 0.7).contract();
        let review = HumanReviewStep::new(
            ConsultationPolicy::default(),
            0.7,
            Arc::new(crate::adapters::DecisionInbox::new("/tmp/unused")),
        )
        .contract();

        assert_eq!(gate.writes, review.writes);
        assert_eq!(
            review.timeout,
            Some(Duration::from_secs(3600) + DEADLINE_MARGIN)
        );
    }
}
