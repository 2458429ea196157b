//! Bounded-concurrency fan-out to specialist agents.
//!
//! Every request yields exactly one [`AgentOutcome`]; a timeout or failure is
//! recorded explicitly, never dropped. Aggregation then checks the quorum
//! and orders successful responses by request id so downstream processing
//! is independent of arrival order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::retry::{retry_transient, RetryPolicy};
use crate::adapters::SpecialistAgent;
use crate::domain::{
    AgentOutcome, AgentRequest, AgentResponse, AgentStatus, AggregatedResponses,
};
use crate::error::{WorkflowError, WorkflowResult};

/// Fan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Agent ids, in request order
    #[serde(default)]
    pub agents: Vec<String>,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Minimum successful responses; defaults to every agent
    #[serde(default)]
    pub quorum: Option<usize>,

    #[serde(default = "default_request_deadline_seconds")]
    pub request_deadline_seconds: u64,
}

const MAX_REQUEST_DEADLINE_SECONDS: u64 = 7 * 24 * 3600;

fn default_max_concurrency() -> usize {
    2
}

fn default_request_deadline_seconds() -> u64 {
    120
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            max_concurrency: default_max_concurrency(),
            quorum: None,
            request_deadline_seconds: default_request_deadline_seconds(),
        }
    }
}

impl CoordinatorConfig {
    pub fn required_quorum(&self) -> usize {
        self.quorum.unwrap_or(self.agents.len())
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_seconds)
    }

    pub fn validate(&self) -> WorkflowResult<()> {
        if self.agents.is_empty() {
            return Err(WorkflowError::configuration(
                "coordination.agents must name at least one specialist agent",
            ));
        }
        let unique: BTreeSet<&String> = self.agents.iter().collect();
        if unique.len() != self.agents.len() {
            return Err(WorkflowError::configuration(
                "coordination.agents contains duplicate ids",
            ));
        }
        if self.request_deadline_seconds == 0 || self.request_deadline_seconds > MAX_REQUEST_DEADLINE_SECONDS {
            return Err(WorkflowError::Configuration(format!(
                "coordination.request_deadline_seconds must be between 1 and {}, got {}",
                MAX_REQUEST_DEADLINE_SECONDS, self.request_deadline_seconds
            )));
        }
        if self.max_concurrency == 0 {
            return Err(WorkflowError::configuration(
                "coordination.max_concurrency must be at least 1",
            ));
        }
        let quorum = self.required_quorum();
        if quorum == 0 || quorum > self.agents.len() {
            return Err(WorkflowError::Configuration(format!(
                "coordination.quorum must be between 1 and {} (agents), got {}",
                self.agents.len(),
                quorum
            )));
        }
        Ok(())
    }
}

/// Dispatches requests to registered agents and aggregates their answers
pub struct AgentCoordinator {
    config: CoordinatorConfig,
    agents: HashMap<String, Arc<dyn SpecialistAgent>>,
    retry: RetryPolicy,
}

impl AgentCoordinator {
    pub fn new(config: CoordinatorConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            agents: HashMap::new(),
            retry,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn SpecialistAgent>) -> Self {
        self.agents.insert(agent.id().to_string(), agent);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of requests one fan-out produces
    pub fn fan_out(&self) -> usize {
        self.config.agents.len()
    }

    /// One request per configured agent, numbered from 1
    pub fn build_requests(&self, correlation_id: Uuid, payload: &Value) -> Vec<AgentRequest> {
        let window = chrono::Duration::from_std(self.config.request_deadline())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = Utc::now() + window;

        self.config
            .agents
            .iter()
            .enumerate()
            .map(|(i, agent_id)| AgentRequest {
                request_id: i as u32 + 1,
                agent_id: agent_id.clone(),
                correlation_id,
                payload: payload.clone(),
                deadline,
            })
            .collect()
    }

    /// Send every request, at most `max_concurrency` at a time. Returns one
    /// outcome per request in completion order.
    #[instrument(skip(self, requests, cancel), fields(requests = requests.len()))]
    pub async fn dispatch(&self, requests: Vec<AgentRequest>, cancel: &CancellationToken) -> Vec<AgentOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut expected: Vec<(u32, String)> = Vec::with_capacity(requests.len());

        for request in requests {
            expected.push((request.request_id, request.agent_id.clone()));

            let Some(agent) = self.agents.get(&request.agent_id).cloned() else {
                warn!(agent = %request.agent_id, "Unknown specialist agent");
                let outcome = AgentOutcome {
                    request_id: request.request_id,
                    agent_id: request.agent_id.clone(),
                    attempts: 0,
                    status: AgentStatus::Failed {
                        error: format!("unknown agent '{}'", request.agent_id),
                    },
                };
                tasks.spawn(async move { outcome });
                continue;
            };

            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let retry = self.retry.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                if permit.is_none() {
                    return AgentOutcome {
                        request_id: request.request_id,
                        agent_id: request.agent_id,
                        attempts: 0,
                        status: AgentStatus::Cancelled,
                    };
                }

                let outcome = invoke_until_deadline(agent.as_ref(), &request, &retry, &cancel).await;
                drop(permit);
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(expected.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Agent task terminated abnormally"),
            }
        }

        // A task that panicked still gets an explicit outcome
        for (request_id, agent_id) in expected {
            if !outcomes.iter().any(|o| o.request_id == request_id) {
                outcomes.push(AgentOutcome {
                    request_id,
                    agent_id,
                    attempts: 0,
                    status: AgentStatus::Failed {
                        error: "agent task terminated abnormally".to_string(),
                    },
                });
            }
        }

        outcomes
    }

    /// Quorum check plus request-id ordering
    pub fn aggregate(&self, outcomes: Vec<AgentOutcome>) -> WorkflowResult<AggregatedResponses> {
        let quorum = self.config.required_quorum();
        let (succeeded, mut failures): (Vec<AgentOutcome>, Vec<AgentOutcome>) =
            outcomes.into_iter().partition(AgentOutcome::is_success);

        let mut responses: Vec<AgentResponse> = succeeded
            .into_iter()
            .filter_map(|o| match o.status {
                AgentStatus::Succeeded { response } => Some(response),
                _ => None,
            })
            .collect();
        responses.sort_by_key(|r| r.request_id);
        failures.sort_by_key(|o| o.request_id);

        if responses.len() < quorum {
            return Err(WorkflowError::InsufficientAgentResponses {
                received: responses.len(),
                required: quorum,
                failures: failures.len(),
            });
        }

        if !failures.is_empty() {
            warn!(
                received = responses.len(),
                failed = failures.len(),
                quorum,
                "Proceeding with partial agent responses"
            );
        }

        Ok(AggregatedResponses {
            responses,
            failures,
            quorum,
        })
    }

    /// Dispatch then aggregate
    pub async fn run(
        &self,
        requests: Vec<AgentRequest>,
        cancel: &CancellationToken,
    ) -> WorkflowResult<AggregatedResponses> {
        let outcomes = self.dispatch(requests, cancel).await;
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        let aggregated = self.aggregate(outcomes)?;
        info!(responses = aggregated.responses.len(), "Agent fan-out complete");
        Ok(aggregated)
    }
}

/// Invoke one agent, retrying transient failures until the request deadline
async fn invoke_until_deadline(
    agent: &dyn SpecialistAgent,
    request: &AgentRequest,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> AgentOutcome {
    let remaining = (request.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let deadline = tokio::time::Instant::now() + remaining;
    let mut attempts = 0u32;

    let operation = format!("agent {}", request.agent_id);
    let invoke = retry_transient(retry, &operation, |attempt| {
        attempts = attempt;
        agent.invoke(request)
    });

    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout_at(deadline, invoke) => Some(result),
    };

    let status = match result {
        None => AgentStatus::Cancelled,
        Some(Err(_)) => {
            warn!(agent = %request.agent_id, request_id = request.request_id, "Agent request timed out");
            AgentStatus::TimedOut {
                deadline: request.deadline,
            }
        }
        Some(Ok(Err(e))) => AgentStatus::Failed {
            error: e.to_string(),
        },
        Some(Ok(Ok(payload))) => AgentStatus::Succeeded {
            response: AgentResponse {
                request_id: request.request_id,
                agent_id: request.agent_id.clone(),
                correlation_id: request.correlation_id,
                payload,
                received_at: Utc::now(),
            },
        },
    };

    AgentOutcome {
        request_id: request.request_id,
        agent_id: request.agent_id.clone(),
        attempts,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DelayedAgent {
        id: String,
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SpecialistAgent for DelayedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, request: &AgentRequest) -> WorkflowResult<Value> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "agent": self.id, "request": request.request_id }))
        }
    }

    fn coordinator(delays: &[(&str, u64)], quorum: Option<usize>, deadline_secs: u64) -> (AgentCoordinator, Arc<AtomicUsize>) {
        let config = CoordinatorConfig {
            agents: delays.iter().map(|(id, _)| id.to_string()).collect(),
            max_concurrency: 2,
            quorum,
            request_deadline_seconds: deadline_secs,
        };
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut coordinator = AgentCoordinator::new(config, RetryPolicy::no_retry());
        for (id, delay_ms) in delays {
            coordinator = coordinator.with_agent(Arc::new(DelayedAgent {
                id: id.to_string(),
                delay: Duration::from_millis(*delay_ms),
                running: running.clone(),
                peak: peak.clone(),
            }));
        }
        (coordinator, peak)
    }

    #[tokio::test]
    async fn test_responses_ordered_by_request_id() {
        let (coordinator, peak) = coordinator(
            &[("sme", 60), ("research", 10), ("regulatory", 30), ("context", 5)],
            None,
            5,
        );
        let requests = coordinator.build_requests(Uuid::new_v4(), &json!({}));
        let aggregated = coordinator
            .run(requests, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<u32> = aggregated.responses.iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(aggregated.failures.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_quorum_met_with_explicit_timeout() {
        // Deadline of one second; "slow" never answers in time
        let (coordinator, _) = coordinator(&[("fast", 5), ("slow", 5_000), ("quick", 5)], Some(2), 1);
        let requests = coordinator.build_requests(Uuid::new_v4(), &json!({}));
        let outcomes = coordinator.dispatch(requests, &CancellationToken::new()).await;
        assert_eq!(outcomes.len(), 3);

        let aggregated = coordinator.aggregate(outcomes).unwrap();
        assert_eq!(aggregated.responses.len(), 2);
        assert_eq!(aggregated.failures.len(), 1);
        assert_eq!(aggregated.failures[0].agent_id, "slow");
        assert!(matches!(aggregated.failures[0].status, AgentStatus::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_quorum_unmet_is_an_error() {
        let (coordinator, _) = coordinator(&[("fast", 5), ("slow", 5_000), ("slower", 5_000)], Some(2), 1);
        let requests = coordinator.build_requests(Uuid::new_v4(), &json!({}));
        let err = coordinator
            .run(requests, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkflowError::InsufficientAgentResponses {
                received,
                required,
                failures,
            } => {
                assert_eq!((received, required, failures), (1, 2, 2));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_agent_is_explicit_failure() {
        let (coordinator, _) = coordinator(&[("sme", 5)], Some(1), 5);
        let mut requests = coordinator.build_requests(Uuid::new_v4(), &json!({}));
        requests.push(AgentRequest {
            request_id: 2,
            agent_id: "ghost".to_string(),
            ..requests[0].clone()
        });

        let outcomes = coordinator.dispatch(requests, &CancellationToken::new()).await;
        let ghost = outcomes.iter().find(|o| o.agent_id == "ghost").unwrap();
        assert!(matches!(ghost.status, AgentStatus::Failed { .. }));
    }

    #[test]
    fn test_config_validation() {
        let config = CoordinatorConfig {
            agents: vec!["sme".to_string()],
            quorum: Some(2),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WorkflowError::Configuration(_))));

        let config = CoordinatorConfig {
            agents: vec!["sme".to_string(), "research".to_string()],
            quorum: Some(1),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(CoordinatorConfig::default().validate().is_err());
    }
}
