//! Test doubles for the oracles, agents and human reviewers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use gampflow::adapters::{ClassifierOracle, GeneratorOracle, HumanDecisionSource, SpecialistAgent};
use gampflow::config::WorkflowConfig;
use gampflow::core::RetryPolicy;
use gampflow::domain::{
    AgentRequest, ClassifierResponse, ConsultationRequest, Document, GampCategory,
    GeneratedArtifact, GenerationContext, HumanDecision, HumanVerdict, SignalCounts,
};
use gampflow::error::{WorkflowError, WorkflowResult};

/// Fast retries and short deadlines
pub fn config(agents: &[&str]) -> WorkflowConfig {
    let mut config = WorkflowConfig::default();
    config.coordination.agents = agents.iter().map(|a| a.to_string()).collect();
    config.coordination.request_deadline_seconds = 5;
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    };
    config.limits.step_timeout_seconds = 10;
    config.limits.collect_timeout_seconds = 5;
    config.limits.run_timeout_seconds = 30;
    config
}

pub fn document() -> Document {
    Document::new("urs-017", "The system shall record batch release decisions.")
}

/// Strong signals for `category`, weak signals for one competitor
pub fn response(category: u8, confidence: f64) -> ClassifierResponse {
    let competitor = if category == 1 { 3 } else { 1 };
    let mut signals = BTreeMap::new();
    signals.insert(category, SignalCounts::new(8, 2, 0));
    signals.insert(competitor, SignalCounts::new(0, 1, 3));

    ClassifierResponse {
        signals,
        predicted_category: Some(category),
        confidence: Some(confidence),
        ..Default::default()
    }
}

/// Classifier that fails transiently a fixed number of times first
pub struct FakeClassifier {
    response: WorkflowResult<ClassifierResponse>,
    transient_failures: u32,
    pub calls: AtomicU32,
}

impl FakeClassifier {
    pub fn returning(response: ClassifierResponse) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(response),
            transient_failures: 0,
            calls: AtomicU32::new(0),
        })
    }

    pub fn flaky(response: ClassifierResponse, transient_failures: u32) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(response),
            transient_failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn malformed() -> Arc<Self> {
        Arc::new(Self {
            response: Err(WorkflowError::ClassificationOracle {
                message: "classifier returned malformed JSON".to_string(),
                diagnostics: Some("category five, probably".to_string()),
            }),
            transient_failures: 0,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierOracle for FakeClassifier {
    async fn classify(&self, _document: &Document) -> WorkflowResult<ClassifierResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.transient_failures {
            return Err(WorkflowError::transient("classify", "connection reset"));
        }
        match self.response {
            Ok(ref response) => Ok(response.clone()),
            Err(WorkflowError::ClassificationOracle {
                ref message,
                ref diagnostics,
            }) => Err(WorkflowError::ClassificationOracle {
                message: message.clone(),
                diagnostics: diagnostics.clone(),
            }),
            Err(ref other) => Err(WorkflowError::classification(other.to_string())),
        }
    }
}

/// Generator that records the context it was given
#[derive(Default)]
pub struct FakeGenerator {
    fail: bool,
    pub seen: Mutex<Option<GenerationContext>>,
}

impl FakeGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            seen: Mutex::new(None),
        })
    }

    pub fn seen(&self) -> GenerationContext {
        self.seen
            .lock()
            .unwrap()
            .clone()
            .expect("generator was not called")
    }
}

#[async_trait]
impl GeneratorOracle for FakeGenerator {
    async fn generate(&self, context: &GenerationContext) -> WorkflowResult<GeneratedArtifact> {
        *self.seen.lock().unwrap() = Some(context.clone());
        if self.fail {
            return Err(WorkflowError::GenerationOracle {
                message: "generator returned an empty artifact".to_string(),
                diagnostics: None,
            });
        }
        Ok(GeneratedArtifact::new(
            format!("{}-oq-plan", context.document.name),
            format!(
                "{} to {} tests for {}",
                context.plan.min_tests, context.plan.max_tests, context.plan.category
            ),
        ))
    }
}

pub enum AgentBehavior {
    Respond,
    Fail,
    Hang,
}

pub struct FakeAgent {
    id: String,
    delay: Duration,
    behavior: AgentBehavior,
}

impl FakeAgent {
    pub fn new(id: &str, delay: Duration, behavior: AgentBehavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            delay,
            behavior,
        })
    }

    pub fn responding(id: &str) -> Arc<Self> {
        Self::new(id, Duration::ZERO, AgentBehavior::Respond)
    }
}

#[async_trait]
impl SpecialistAgent for FakeAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: &AgentRequest) -> WorkflowResult<Value> {
        tokio::time::sleep(self.delay).await;
        match self.behavior {
            AgentBehavior::Respond => Ok(json!({
                "agent": self.id,
                "request_id": request.request_id,
            })),
            AgentBehavior::Fail => Err(WorkflowError::GenerationOracle {
                message: format!("{} could not answer", self.id),
                diagnostics: None,
            }),
            AgentBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Answers every consultation with the same verdict
pub struct ScriptedReviewer {
    verdict: Option<HumanVerdict>,
    category: Option<GampCategory>,
    pub requests: Mutex<Vec<ConsultationRequest>>,
}

impl ScriptedReviewer {
    pub fn approving() -> Arc<Self> {
        Self::with(Some(HumanVerdict::Approve), None)
    }

    pub fn rejecting() -> Arc<Self> {
        Self::with(Some(HumanVerdict::Reject), None)
    }

    pub fn modifying(category: GampCategory) -> Arc<Self> {
        Self::with(Some(HumanVerdict::Modify), Some(category))
    }

    /// Never answers
    pub fn absent() -> Arc<Self> {
        Self::with(None, None)
    }

    fn with(verdict: Option<HumanVerdict>, category: Option<GampCategory>) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            category,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ConsultationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanDecisionSource for ScriptedReviewer {
    async fn await_decision(&self, request: &ConsultationRequest) -> WorkflowResult<HumanDecision> {
        self.requests.lock().unwrap().push(request.clone());
        let Some(verdict) = self.verdict else {
            std::future::pending::<()>().await;
            unreachable!()
        };

        Ok(HumanDecision {
            consultation_id: request.id,
            verdict,
            actor: "qa-lead".to_string(),
            category: self.category,
            comment: Some("reviewed against the URS".to_string()),
            decided_at: Utc::now(),
        })
    }
}
