//! Consultation requests and decisions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::category::{CategorizationResult, GampCategory};

/// Why a consultation is required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationReason {
    ConfidenceBelowFloor,
    AmbiguousCategories,
    HighRiskCategory,
    ClassifierRiskFlag,
}

impl ConsultationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfidenceBelowFloor => "confidence_below_floor",
            Self::AmbiguousCategories => "ambiguous_categories",
            Self::HighRiskCategory => "high_risk_category",
            Self::ClassifierRiskFlag => "classifier_risk_flag",
        }
    }

    /// Expertise a reviewer needs for this reason
    pub fn expertise(self) -> &'static str {
        match self {
            Self::ConfidenceBelowFloor | Self::AmbiguousCategories => "gamp_categorization",
            Self::HighRiskCategory => "validation_lead",
            Self::ClassifierRiskFlag => "quality_assurance",
        }
    }
}

impl fmt::Display for ConsultationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
}

/// A request for human sign-off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultationRequest {
    pub id: Uuid,
    pub run_id: Uuid,

    /// Primary reason (first applicable in priority order)
    pub reason: ConsultationReason,

    /// Every reason that applied
    pub reasons: Vec<ConsultationReason>,

    pub required_expertise: Vec<String>,
    pub urgency: Urgency,
    pub triggering_step: String,

    /// Categorization the request was raised for
    pub categorization: CategorizationResult,

    pub created_at: DateTime<Utc>,
}

/// Outcome recorded for a consultation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Consultation needed and still pending
    Required,
    /// Skipped under validation mode, with an audit record
    Bypassed,
    /// Closed (by a human, by an audited bypass, or because none was needed)
    Resolved,
}

/// Verdict returned by a human reviewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanVerdict {
    Approve,
    Reject,
    /// Approve with a corrected category
    Modify,
}

/// A decision delivered by the human-decision interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub consultation_id: Uuid,
    pub verdict: HumanVerdict,
    pub actor: String,

    /// Required for `modify`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<GampCategory>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default = "Utc::now")]
    pub decided_at: DateTime<Utc>,
}

/// Decision that downstream steps observe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultationDecision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_id: Option<Uuid>,

    pub outcome: DecisionOutcome,

    /// Always present for bypassed decisions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_justification: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<HumanVerdict>,

    /// Category downstream steps must use
    pub final_category: GampCategory,

    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_names() {
        let json = serde_json::to_string(&ConsultationReason::ConfidenceBelowFloor).unwrap();
        assert_eq!(json, "\"confidence_below_floor\"");
        assert_eq!(
            ConsultationReason::AmbiguousCategories.to_string(),
            "ambiguous_categories"
        );
    }

    #[test]
    fn test_human_decision_defaults_timestamp() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"consultation_id":"{}","verdict":"modify","actor":"qa-lead","category":4}}"#,
            id
        );
        let decision: HumanDecision = serde_json::from_str(&json).unwrap();

        assert_eq!(decision.verdict, HumanVerdict::Modify);
        assert_eq!(decision.category, Some(GampCategory::Category4));
        assert!(decision.comment.is_none());
    }
}
