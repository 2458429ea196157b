//! Specialist agent requests, responses and per-request outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request sent to one specialist agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Position within the fan-out; aggregation orders by this
    pub request_id: u32,
    pub agent_id: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
    pub deadline: DateTime<Utc>,
}

/// A specialist agent's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub request_id: u32,
    pub agent_id: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,

    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// What happened to a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentStatus {
    Succeeded { response: AgentResponse },
    TimedOut { deadline: DateTime<Utc> },
    Failed { error: String },
    Cancelled,
}

/// Recorded result for one request, success or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub request_id: u32,
    pub agent_id: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub status: AgentStatus,
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, AgentStatus::Succeeded { .. })
    }

    pub fn response(&self) -> Option<&AgentResponse> {
        match &self.status {
            AgentStatus::Succeeded { response } => Some(response),
            _ => None,
        }
    }
}

/// Quorum-checked, request-ordered responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResponses {
    /// Successful responses sorted by request id
    pub responses: Vec<AgentResponse>,

    /// Explicit partial failures, sorted by request id
    pub failures: Vec<AgentOutcome>,

    pub quorum: usize,
}
