//! Workflow orchestrator.
//!
//! Wires the categorization steps into a graph, gives every run its own
//! directory (events, context, audit log, checkpoints, decisions) and drives
//! it with the step scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::audit::{AuditSink, JsonlAuditLog};
use super::categorization::CategorizationEngine;
use super::checkpoint::{CheckpointStore, FileCheckpointStore};
use super::context::ContextStore;
use super::coordinator::AgentCoordinator;
use super::run_store::RunStore;
use super::scheduler::{Step, StepScheduler, WorkflowGraph};
use super::steps::{
    AggregationStep, CategorizationStep, CompletionStep, ConsultationGateStep, CoordinationStep,
    GenerationStep, HumanReviewStep, IngestionStep, PlanningStep,
};
use crate::adapters::{
    ClassifierOracle, CommandOracle, DecisionInbox, GeneratorOracle, HumanDecisionSource,
    SpecialistAgent,
};
use crate::config::{CommandSpec, WorkflowConfig};
use crate::domain::{AuditRecord, Document, EventPayload, RunRecord, RunStatus, WorkflowRun};
use crate::error::{WorkflowError, WorkflowResult};

/// Runs GAMP categorization workflows
pub struct WorkflowOrchestrator {
    config: WorkflowConfig,
    history: RunHistory,
    classifier: Arc<dyn ClassifierOracle>,
    generator: Arc<dyn GeneratorOracle>,
    coordinator: Arc<AgentCoordinator>,

    /// Overrides the per-run decision inbox
    decisions: Option<Arc<dyn HumanDecisionSource>>,

    cancel: CancellationToken,
}

impl WorkflowOrchestrator {
    /// Build an orchestrator from explicit collaborators. The configuration
    /// is validated here, before any run starts.
    pub fn new(
        config: WorkflowConfig,
        runs_dir: impl Into<PathBuf>,
        classifier: Arc<dyn ClassifierOracle>,
        generator: Arc<dyn GeneratorOracle>,
        agents: Vec<Arc<dyn SpecialistAgent>>,
    ) -> WorkflowResult<Self> {
        config.validate()?;

        let coordinator = agents.into_iter().fold(
            AgentCoordinator::new(config.coordination.clone(), config.retry.clone()),
            |coordinator, agent| coordinator.with_agent(agent),
        );

        Ok(Self {
            config,
            history: RunHistory::new(runs_dir),
            classifier,
            generator,
            coordinator: Arc::new(coordinator),
            decisions: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Build an orchestrator whose oracles and agents are the programs named
    /// under `oracles` in the configuration
    pub fn from_config(config: WorkflowConfig, runs_dir: impl Into<PathBuf>) -> WorkflowResult<Self> {
        config.validate_oracles()?;

        let command = |name: &str, spec: &CommandSpec| {
            CommandOracle::new(name, spec.command.clone())
                .with_args(spec.args.clone())
                .with_timeout(spec.timeout())
        };

        let oracles = &config.oracles;
        let (Some(classifier), Some(generator)) = (&oracles.classifier, &oracles.generator) else {
            return Err(WorkflowError::configuration("oracles are not configured"));
        };
        let classifier: Arc<dyn ClassifierOracle> = Arc::new(command("classifier", classifier));
        let generator: Arc<dyn GeneratorOracle> = Arc::new(command("generator", generator));

        let agents: Vec<Arc<dyn SpecialistAgent>> = config
            .coordination
            .agents
            .iter()
            .filter_map(|id| oracles.agents.get(id).map(|spec| (id, spec)))
            .map(|(id, spec)| Arc::new(command(id.as_str(), spec)) as Arc<dyn SpecialistAgent>)
            .collect();

        Self::new(config, runs_dir, classifier, generator, agents)
    }

    /// Use one decision source for every run instead of the run's inbox
    pub fn with_decision_source(mut self, source: Arc<dyn HumanDecisionSource>) -> Self {
        self.decisions = Some(source);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn runs_dir(&self) -> &Path {
        self.history.runs_dir()
    }

    /// Cancelling this token aborts every run this orchestrator drives
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a document through the workflow to a terminal status
    #[instrument(skip(self, document), fields(document = %document.name))]
    pub async fn run(&self, document: Document) -> WorkflowResult<WorkflowRun> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "Starting workflow");

        let store = Arc::new(RunStore::open_in(self.runs_dir(), run_id).await?);
        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditLog::open(store.audit_path()).await?);
        let context = Arc::new(
            ContextStore::open(run_id, store.context_path())
                .await?
                .with_audit(Arc::clone(&audit)),
        );

        let scheduler = self.scheduler(&store, audit)?;
        scheduler
            .run(
                run_id,
                context,
                EventPayload::WorkflowStarted { document },
                self.cancel.clone(),
            )
            .await
    }

    /// Continue a failed or interrupted run from its latest checkpoint
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> WorkflowResult<WorkflowRun> {
        self.history.ensure_exists(run_id)?;
        let store = Arc::new(RunStore::open_in(self.runs_dir(), run_id).await?);

        if let Some(record) = store.load_record().await? {
            if matches!(record.status, RunStatus::Completed) {
                return Err(WorkflowError::Configuration(format!(
                    "run {} already completed",
                    run_id
                )));
            }
        }

        let checkpoints = FileCheckpointStore::new(self.runs_dir());
        let checkpoint = checkpoints.load(run_id).await?.ok_or_else(|| {
            WorkflowError::Configuration(format!("run {} has no checkpoint to resume from", run_id))
        })?;
        info!(step = %checkpoint.step_name, "Resuming from checkpoint");

        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditLog::open(store.audit_path()).await?);
        let context = Arc::new(
            ContextStore::open(run_id, store.context_path())
                .await?
                .with_audit(Arc::clone(&audit)),
        );

        let scheduler = self.scheduler(&store, audit)?;
        scheduler.resume(checkpoint, context, self.cancel.clone()).await
    }

    /// Persisted state of a run
    pub async fn status(&self, run_id: Uuid) -> WorkflowResult<RunRecord> {
        self.history.status(run_id).await
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> WorkflowResult<Vec<RunRecord>> {
        self.history.list_runs(limit).await
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    fn scheduler(&self, store: &Arc<RunStore>, audit: Arc<dyn AuditSink>) -> WorkflowResult<StepScheduler> {
        let decisions: Arc<dyn HumanDecisionSource> = match self.decisions {
            Some(ref source) => Arc::clone(source),
            None => Arc::new(DecisionInbox::new(store.decisions_dir())),
        };

        let graph = WorkflowGraph::new(self.steps(decisions))?;
        let mut scheduler = StepScheduler::new(
            graph,
            self.config.limits.clone(),
            self.config.retry.clone(),
            audit,
        )
        .with_run_store(Arc::clone(store));

        if self.config.checkpoints {
            scheduler = scheduler.with_checkpoints(Arc::new(FileCheckpointStore::new(self.runs_dir())));
        }
        Ok(scheduler)
    }

    fn steps(&self, decisions: Arc<dyn HumanDecisionSource>) -> Vec<Arc<dyn Step>> {
        let config = &self.config;
        let floor = config.categorization.confidence_floor;

        vec![
            Arc::new(IngestionStep::new(config.limits.clone())),
            Arc::new(CategorizationStep::new(
                Arc::clone(&self.classifier),
                CategorizationEngine::new(config.categorization.clone()),
            )),
            Arc::new(ConsultationGateStep::new(config.consultation.clone(), floor)),
            Arc::new(HumanReviewStep::new(config.consultation.clone(), floor, decisions)),
            Arc::new(PlanningStep::new(config.coordination.agents.clone())),
            Arc::new(CoordinationStep::new(Arc::clone(&self.coordinator))),
            Arc::new(AggregationStep::new(
                Arc::clone(&self.coordinator),
                config.limits.collect_timeout(),
            )),
            Arc::new(GenerationStep::new(Arc::clone(&self.generator))),
            Arc::new(CompletionStep),
        ]
    }
}

/// Read-only access to persisted runs. Needs no oracles.
pub struct RunHistory {
    runs_dir: PathBuf,
}

impl RunHistory {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    fn ensure_exists(&self, run_id: Uuid) -> WorkflowResult<()> {
        if self.run_dir(run_id).is_dir() {
            Ok(())
        } else {
            Err(WorkflowError::Configuration(format!(
                "run {} not found in {}",
                run_id,
                self.runs_dir.display()
            )))
        }
    }

    /// Persisted state of a run. A run that has not reached its first
    /// checkpoint is reconstructed from its event log.
    pub async fn status(&self, run_id: Uuid) -> WorkflowResult<RunRecord> {
        self.ensure_exists(run_id)?;
        let store = RunStore::open_in(&self.runs_dir, run_id).await?;

        if let Some(record) = store.load_record().await? {
            return Ok(record);
        }

        let events = store.replay_events().await?;
        let mut run = WorkflowRun::new(run_id);
        run.start();
        if let Some(first) = events.first() {
            run.started_at = first.timestamp;
        }
        for event in &events {
            run.record_produced(event);
        }
        Ok(run.to_record(BTreeMap::new(), store.audit_path().display().to_string()))
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> WorkflowResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        for run_id in RunStore::list_runs_in(&self.runs_dir).await? {
            match self.status(run_id).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }

    /// Every audit record of a run, in append order
    pub async fn audit_trail(&self, run_id: Uuid) -> WorkflowResult<Vec<AuditRecord>> {
        self.ensure_exists(run_id)?;
        let log = JsonlAuditLog::open(self.run_dir(run_id).join("audit.jsonl")).await?;
        Ok(log.records_for_run(run_id).await?)
    }

    /// Inbox holding the consultation requests and decisions of a run
    pub fn decision_inbox(&self, run_id: Uuid) -> WorkflowResult<DecisionInbox> {
        self.ensure_exists(run_id)?;
        Ok(DecisionInbox::new(self.run_dir(run_id).join("decisions")))
    }
}
