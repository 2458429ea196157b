//! Documents flowing into a run and artifacts flowing out of it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentResponse;
use super::category::{CategorizationResult, GampCategory};
use super::consultation::ConsultationDecision;

/// A document submitted for categorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub content: String,

    /// Where the document was read from, checked against the denylist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            source_path: None,
        }
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn size_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Validation rigor derived from the final category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPlan {
    pub category: GampCategory,
    pub min_tests: u32,
    pub max_tests: u32,
    pub focus: String,

    /// Specialist agents to consult, in request-id order
    pub agents: Vec<String>,
}

impl ValidationPlan {
    /// Test counts and focus area per category
    pub fn for_category(category: GampCategory, agents: Vec<String>) -> Self {
        let (min_tests, max_tests, focus) = match category {
            GampCategory::Category1 => (3, 5, "infrastructure qualification"),
            GampCategory::Category3 => (5, 10, "standard configuration verification"),
            GampCategory::Category4 => (15, 20, "configured product validation"),
            GampCategory::Category5 => (25, 30, "custom application validation"),
        };
        Self {
            category,
            min_tests,
            max_tests,
            focus: focus.to_string(),
            agents,
        }
    }
}

/// Everything the generator oracle receives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationContext {
    pub document: Document,
    pub categorization: CategorizationResult,
    pub decision: ConsultationDecision,
    pub plan: ValidationPlan,

    /// Agent responses ordered by request id
    pub agent_responses: Vec<AgentResponse>,
}

/// Artifact produced by the generator oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub name: String,
    pub content: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub size_bytes: u64,
}

impl GeneratedArtifact {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let size_bytes = content.len() as u64;
        Self {
            name: name.into(),
            content,
            created_at: Utc::now(),
            size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rigor_per_category() {
        let plan = ValidationPlan::for_category(GampCategory::Category5, vec!["sme".into()]);
        assert_eq!((plan.min_tests, plan.max_tests), (25, 30));

        let plan = ValidationPlan::for_category(GampCategory::Category1, Vec::new());
        assert_eq!((plan.min_tests, plan.max_tests), (3, 5));
    }

    #[test]
    fn test_artifact_creation() {
        let artifact = GeneratedArtifact::new("oq-protocol", "OQ-001: verify audit trail");
        assert_eq!(artifact.name, "oq-protocol");
        assert_eq!(artifact.size_bytes, 26);
    }
}
