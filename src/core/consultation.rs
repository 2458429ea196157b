//! Consultation gate: decides whether a categorization needs human review.
//!
//! ```text
//! Evaluating ─┬─> NotRequired
//!             └─> Required ─┬─> Bypassed ─────┬─> Resolved
//!                           └─> AwaitingHuman ─┘
//! ```
//!
//! Bypassed is only reachable under validation mode and is closed straight
//! away; the decision keeps outcome `Bypassed`.
//!
//! Every transition appends a `ConsultationTransition` audit record. A
//! bypass additionally appends a `ConsultationBypassed` record before the
//! decision is returned, so no downstream step can observe an unaudited
//! bypass.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::audit::AuditSink;
use crate::domain::{
    AuditEntry, AuditRecord, CategorizationResult, ConsultationDecision, ConsultationReason,
    ConsultationRequest, DecisionOutcome, GampCategory, HumanDecision, HumanVerdict, Urgency,
};
use crate::error::{WorkflowError, WorkflowResult};

/// Controlled-testing mode that allows audited bypass of consultation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMode {
    #[serde(default)]
    pub enabled: bool,

    /// Recorded with every bypass
    pub justification: String,

    #[serde(default)]
    pub bypass_allowed_categories: Vec<GampCategory>,

    #[serde(default = "default_bypass_confidence_threshold")]
    pub bypass_confidence_threshold: f64,

    /// Actor named in bypass audit records
    #[serde(default = "default_bypass_actor")]
    pub actor: String,
}

fn default_bypass_confidence_threshold() -> f64 {
    0.7
}

fn default_bypass_actor() -> String {
    "validation_mode".to_string()
}

/// When consultation is required and how it may be skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultationPolicy {
    #[serde(default = "default_high_risk_categories")]
    pub high_risk_categories: Vec<GampCategory>,

    /// Absent means bypass is never permitted
    #[serde(default)]
    pub validation_mode: Option<ValidationMode>,

    /// How long a pending consultation may block the run
    #[serde(default = "default_decision_timeout_seconds")]
    pub decision_timeout_seconds: u64,
}

fn default_high_risk_categories() -> Vec<GampCategory> {
    vec![GampCategory::Category5]
}

fn default_decision_timeout_seconds() -> u64 {
    3600
}

impl Default for ConsultationPolicy {
    fn default() -> Self {
        Self {
            high_risk_categories: default_high_risk_categories(),
            validation_mode: None,
            decision_timeout_seconds: default_decision_timeout_seconds(),
        }
    }
}

impl ConsultationPolicy {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_seconds)
    }

    pub fn validate(&self) -> WorkflowResult<()> {
        if let Some(ref mode) = self.validation_mode {
            if mode.enabled && mode.justification.trim().is_empty() {
                return Err(WorkflowError::configuration(
                    "consultation.validation_mode is enabled without a justification",
                ));
            }
            if !(0.0..=1.0).contains(&mode.bypass_confidence_threshold) {
                return Err(WorkflowError::Configuration(format!(
                    "consultation.validation_mode.bypass_confidence_threshold must be within [0, 1], got {}",
                    mode.bypass_confidence_threshold
                )));
            }
        }
        if self.decision_timeout_seconds == 0 {
            return Err(WorkflowError::configuration(
                "consultation.decision_timeout_seconds must be positive",
            ));
        }
        Ok(())
    }

    /// Check whether `result` may be bypassed under validation mode
    pub fn bypass_permitted(&self, result: &CategorizationResult) -> WorkflowResult<&ValidationMode> {
        let mode = match self.validation_mode {
            Some(ref mode) if mode.enabled => mode,
            Some(_) => {
                return Err(WorkflowError::BypassNotPermitted(
                    "validation mode is disabled".to_string(),
                ))
            }
            None => {
                return Err(WorkflowError::BypassNotPermitted(
                    "validation mode is not configured".to_string(),
                ))
            }
        };

        if !mode.bypass_allowed_categories.contains(&result.predicted) {
            return Err(WorkflowError::BypassNotPermitted(format!(
                "{} is not in the bypass-allowed set",
                result.predicted
            )));
        }
        if result.confidence < mode.bypass_confidence_threshold {
            return Err(WorkflowError::BypassNotPermitted(format!(
                "confidence {:.2} is below bypass threshold {:.2}",
                result.confidence, mode.bypass_confidence_threshold
            )));
        }

        Ok(mode)
    }
}

/// Consultation gate states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Evaluating,
    NotRequired,
    Required,
    AwaitingHuman,
    Bypassed,
    Resolved,
}

impl GateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evaluating => "evaluating",
            Self::NotRequired => "not_required",
            Self::Required => "required",
            Self::AwaitingHuman => "awaiting_human",
            Self::Bypassed => "bypassed",
            Self::Resolved => "resolved",
        }
    }

    pub fn can_transition_to(self, next: GateState) -> bool {
        use GateState::*;
        matches!(
            (self, next),
            (Evaluating, NotRequired)
                | (Evaluating, Required)
                | (Required, AwaitingHuman)
                | (Required, Bypassed)
                | (Bypassed, Resolved)
                | (AwaitingHuman, Resolved)
        )
    }

    /// Downstream steps may proceed
    pub fn is_cleared(self) -> bool {
        matches!(self, Self::NotRequired | Self::Bypassed | Self::Resolved)
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate state persisted in the context store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub state: GateState,
    pub categorization: CategorizationResult,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConsultationRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ConsultationDecision>,
}

impl GateRecord {
    pub fn consultation_id(&self) -> Option<Uuid> {
        self.request.as_ref().map(|r| r.id)
    }
}

/// Consultation state machine for one run
pub struct ConsultationGate {
    run_id: Uuid,
    policy: ConsultationPolicy,
    confidence_floor: f64,
    audit: Arc<dyn AuditSink>,
}

impl ConsultationGate {
    pub fn new(
        run_id: Uuid,
        policy: ConsultationPolicy,
        confidence_floor: f64,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            run_id,
            policy,
            confidence_floor,
            audit,
        }
    }

    pub fn policy(&self) -> &ConsultationPolicy {
        &self.policy
    }

    /// Every applicable reason, in priority order
    pub fn reasons(&self, result: &CategorizationResult) -> Vec<ConsultationReason> {
        let mut reasons = Vec::new();
        if result.confidence < self.confidence_floor {
            reasons.push(ConsultationReason::ConfidenceBelowFloor);
        }
        if result.ambiguous {
            reasons.push(ConsultationReason::AmbiguousCategories);
        }
        if self.policy.high_risk_categories.contains(&result.predicted) {
            reasons.push(ConsultationReason::HighRiskCategory);
        }
        if result.risk_flag {
            reasons.push(ConsultationReason::ClassifierRiskFlag);
        }
        reasons
    }

    /// Evaluating -> NotRequired | Required
    pub async fn evaluate(
        &self,
        result: CategorizationResult,
        triggering_step: &str,
    ) -> WorkflowResult<GateRecord> {
        let reasons = self.reasons(&result);

        let mut record = GateRecord {
            state: GateState::Evaluating,
            categorization: result,
            request: None,
            decision: None,
        };

        let Some(&reason) = reasons.first() else {
            self.transition(&mut record, GateState::NotRequired, triggering_step, None)
                .await?;
            record.decision = Some(ConsultationDecision {
                consultation_id: None,
                outcome: DecisionOutcome::Resolved,
                bypass_justification: None,
                verdict: None,
                final_category: record.categorization.predicted,
                actor: triggering_step.to_string(),
                timestamp: Utc::now(),
            });
            return Ok(record);
        };

        let mut required_expertise: Vec<String> = Vec::new();
        for r in &reasons {
            let expertise = r.expertise().to_string();
            if !required_expertise.contains(&expertise) {
                required_expertise.push(expertise);
            }
        }

        let high_urgency = matches!(
            record.categorization.predicted,
            GampCategory::Category4 | GampCategory::Category5
        ) || record.categorization.risk_flag;

        let request = ConsultationRequest {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            reason,
            reasons: reasons.clone(),
            required_expertise,
            urgency: if high_urgency { Urgency::High } else { Urgency::Normal },
            triggering_step: triggering_step.to_string(),
            categorization: record.categorization.clone(),
            created_at: Utc::now(),
        };
        record.request = Some(request);

        let detail = reasons
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.transition(&mut record, GateState::Required, triggering_step, Some(detail))
            .await?;

        Ok(record)
    }

    /// Required -> Bypassed when validation mode permits it, otherwise
    /// Required -> AwaitingHuman
    pub async fn route(&self, record: &mut GateRecord, actor: &str) -> WorkflowResult<()> {
        let permitted = self
            .policy
            .bypass_permitted(&record.categorization)
            .map(|mode| (mode.justification.clone(), mode.actor.clone()));

        match permitted {
            Ok((justification, bypass_actor)) => {
                self.bypass(record, &justification, &bypass_actor).await?;
                Ok(())
            }
            Err(reason) => {
                info!(run_id = %self.run_id, reason = %reason, "Consultation awaiting human decision");
                self.transition(record, GateState::AwaitingHuman, actor, None)
                    .await
            }
        }
    }

    /// Required -> Bypassed -> Resolved. Fails hard unless validation mode is
    /// enabled and permits this categorization.
    pub async fn bypass(
        &self,
        record: &mut GateRecord,
        justification: &str,
        actor: &str,
    ) -> WorkflowResult<ConsultationDecision> {
        if !record.state.can_transition_to(GateState::Bypassed) {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: GateState::Bypassed.to_string(),
            });
        }
        if justification.trim().is_empty() {
            return Err(WorkflowError::BypassNotPermitted(
                "bypass requires a justification".to_string(),
            ));
        }
        self.policy.bypass_permitted(&record.categorization)?;

        let Some(request) = record.request.clone() else {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: GateState::Bypassed.to_string(),
            });
        };

        // The bypass record must be durable before anything observes the decision
        self.append(
            actor,
            AuditEntry::ConsultationBypassed {
                consultation_id: request.id,
                original_reason: request.reason,
                justification: justification.to_string(),
                category: record.categorization.predicted,
                confidence: record.categorization.confidence,
                not_a_fallback: true,
            },
        )
        .await?;

        warn!(
            run_id = %self.run_id,
            consultation_id = %request.id,
            reason = %request.reason,
            actor,
            "Consultation bypassed under validation mode"
        );

        self.transition(record, GateState::Bypassed, actor, Some(justification.to_string()))
            .await?;
        self.transition(
            record,
            GateState::Resolved,
            actor,
            Some("closed under validation mode".to_string()),
        )
        .await?;

        let decision = ConsultationDecision {
            consultation_id: Some(request.id),
            outcome: DecisionOutcome::Bypassed,
            bypass_justification: Some(justification.to_string()),
            verdict: None,
            final_category: record.categorization.predicted,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        };
        record.decision = Some(decision.clone());
        Ok(decision)
    }

    /// AwaitingHuman -> Resolved. A rejection resolves the gate and then
    /// fails the run.
    pub async fn resolve(
        &self,
        record: &mut GateRecord,
        decision: HumanDecision,
    ) -> WorkflowResult<ConsultationDecision> {
        // Human verdicts only close a gate that is waiting for one
        if record.state != GateState::AwaitingHuman {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: GateState::Resolved.to_string(),
            });
        }

        let pending = record.consultation_id();
        if pending != Some(decision.consultation_id) {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: format!("{} (decision for consultation {})", GateState::Resolved, decision.consultation_id),
            });
        }

        let final_category = match decision.verdict {
            HumanVerdict::Approve | HumanVerdict::Reject => record.categorization.predicted,
            HumanVerdict::Modify => decision.category.ok_or_else(|| {
                WorkflowError::configuration(format!(
                    "modify decision from {} has no category",
                    decision.actor
                ))
            })?,
        };

        let verdict = match decision.verdict {
            HumanVerdict::Approve => "approve",
            HumanVerdict::Reject => "reject",
            HumanVerdict::Modify => "modify",
        };
        let detail = match decision.comment {
            Some(ref comment) => format!("{} by {}: {}", verdict, decision.actor, comment),
            None => format!("{} by {}", verdict, decision.actor),
        };
        self.transition(record, GateState::Resolved, &decision.actor, Some(detail))
            .await?;

        let resolved = ConsultationDecision {
            consultation_id: Some(decision.consultation_id),
            outcome: DecisionOutcome::Resolved,
            bypass_justification: None,
            verdict: Some(decision.verdict),
            final_category,
            actor: decision.actor.clone(),
            timestamp: decision.decided_at,
        };
        record.decision = Some(resolved.clone());

        if decision.verdict == HumanVerdict::Reject {
            return Err(WorkflowError::ConsultationRejected {
                consultation_id: decision.consultation_id,
                actor: decision.actor,
                reason: decision
                    .comment
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        info!(
            run_id = %self.run_id,
            consultation_id = %decision.consultation_id,
            category = final_category.number(),
            "Consultation resolved"
        );
        Ok(resolved)
    }

    /// Record that a pending consultation expired and build the error
    pub async fn expire(&self, record: &GateRecord, waited: Duration) -> WorkflowError {
        let Some(consultation_id) = record.consultation_id() else {
            return WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: "timed_out".to_string(),
            };
        };

        let entry = AuditEntry::ConsultationTransition {
            consultation_id: Some(consultation_id),
            from: record.state.to_string(),
            to: "timed_out".to_string(),
            detail: Some(format!("no decision after {:?}", waited)),
        };
        if let Err(e) = self.append("scheduler", entry).await {
            return e;
        }

        WorkflowError::ConsultationTimeout {
            consultation_id,
            waited,
        }
    }

    async fn transition(
        &self,
        record: &mut GateRecord,
        next: GateState,
        actor: &str,
        detail: Option<String>,
    ) -> WorkflowResult<()> {
        if !record.state.can_transition_to(next) {
            return Err(WorkflowError::InvalidGateTransition {
                from: record.state.to_string(),
                to: next.to_string(),
            });
        }

        self.append(
            actor,
            AuditEntry::ConsultationTransition {
                consultation_id: record.consultation_id(),
                from: record.state.to_string(),
                to: next.to_string(),
                detail,
            },
        )
        .await?;

        record.state = next;
        Ok(())
    }

    async fn append(&self, actor: &str, entry: AuditEntry) -> WorkflowResult<()> {
        self.audit
            .append(&AuditRecord::new(self.run_id, actor, entry))
            .await?;
        Ok(())
    }
}
