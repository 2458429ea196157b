//! Event-driven step scheduler.
//!
//! Steps declare a static contract (consumed kinds, produced kinds, context
//! keys written). The graph is validated once at construction; at runtime
//! the scheduler routes each event to exactly one consumer, buffers fan-in
//! collections, wraps every execution with a timeout and the run's
//! cancellation token, and optionally checkpoints after each step.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::audit::AuditSink;
use super::checkpoint::{Checkpoint, CheckpointStore};
use super::context::{ContextEntry, ContextStore};
use super::retry::RetryPolicy;
use super::run_store::RunStore;
use super::safety::{SafetyLimits, SafetyTracker};
use crate::domain::{
    AuditEntry, AuditRecord, Event, EventKind, EventPayload, RunStatus, WorkflowRun,
};
use crate::error::{FailureReport, WorkflowError, WorkflowResult};

/// How a step consumes events
#[derive(Debug, Clone, PartialEq)]
pub enum Consumes {
    /// Fire once per event of any listed kind
    Each(Vec<EventKind>),

    /// Fan-in: fire once `count` events of `kind` have arrived, or when the
    /// collection times out
    Collect {
        kind: EventKind,
        count: usize,
        timeout: Option<Duration>,
    },
}

impl Consumes {
    pub fn kinds(&self) -> Vec<EventKind> {
        match self {
            Self::Each(kinds) => kinds.clone(),
            Self::Collect { kind, .. } => vec![*kind],
        }
    }
}

/// Static declaration of what a step consumes, produces and writes
#[derive(Debug, Clone, PartialEq)]
pub struct StepContract {
    pub consumes: Consumes,
    pub produces: Vec<EventKind>,

    /// Context keys the step writes; steps with overlapping keys never run
    /// concurrently
    pub writes: Vec<String>,

    /// Overrides the run-wide step timeout
    pub timeout: Option<Duration>,
}

impl StepContract {
    pub fn consumes(kind: EventKind) -> Self {
        Self::consumes_any(vec![kind])
    }

    pub fn consumes_any(kinds: Vec<EventKind>) -> Self {
        Self {
            consumes: Consumes::Each(kinds),
            produces: Vec::new(),
            writes: Vec::new(),
            timeout: None,
        }
    }

    pub fn collect(kind: EventKind, count: usize) -> Self {
        Self {
            consumes: Consumes::Collect {
                kind,
                count,
                timeout: None,
            },
            produces: Vec::new(),
            writes: Vec::new(),
            timeout: None,
        }
    }

    pub fn produces(mut self, kind: EventKind) -> Self {
        if !self.produces.contains(&kind) {
            self.produces.push(kind);
        }
        self
    }

    pub fn writes(mut self, key: impl Into<String>) -> Self {
        self.writes.push(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Per-collection timeout (fan-in contracts only)
    pub fn collect_timeout(mut self, timeout: Duration) -> Self {
        if let Consumes::Collect { timeout: ref mut t, .. } = self.consumes {
            *t = Some(timeout);
        }
        self
    }
}

/// What a step receives when it fires
#[derive(Debug, Clone)]
pub enum StepInput {
    Event(Event),

    /// A complete fan-in batch, in arrival order
    Collected(Vec<Event>),

    /// The collection deadline passed before `expected` events arrived
    CollectionTimedOut { received: Vec<Event>, expected: usize },
}

impl StepInput {
    pub fn events(&self) -> &[Event] {
        match self {
            Self::Event(event) => std::slice::from_ref(event),
            Self::Collected(events) => events,
            Self::CollectionTimedOut { received, .. } => received,
        }
    }

    pub fn into_events(self) -> Vec<Event> {
        match self {
            Self::Event(event) => vec![event],
            Self::Collected(events) => events,
            Self::CollectionTimedOut { received, .. } => received,
        }
    }

    pub fn summary(&self) -> String {
        let events: Vec<String> = self.events().iter().map(Event::summary).collect();
        match self {
            Self::CollectionTimedOut { expected, .. } => {
                format!("[{}] (timed out, expected {})", events.join(", "), expected)
            }
            _ => format!("[{}]", events.join(", ")),
        }
    }
}

/// Everything a step may touch while running
#[derive(Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub step: String,
    pub context: Arc<ContextStore>,
    pub audit: Arc<dyn AuditSink>,
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Typed read; a missing key is a `MissingContext` error naming this step
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> WorkflowResult<T> {
        self.context.get_as(key, &self.step).await
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> WorkflowResult<u64> {
        self.context.set_as(key, value, &self.step).await
    }

    pub async fn audit(&self, entry: AuditEntry) -> WorkflowResult<()> {
        let record = AuditRecord::new(self.run_id, self.step.clone(), entry);
        self.audit.append(&record).await?;
        Ok(())
    }

    pub fn ensure_active(&self) -> WorkflowResult<()> {
        if self.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Await `fut` unless the run is cancelled first
    pub async fn suspend<F: std::future::Future>(&self, fut: F) -> WorkflowResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WorkflowError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// A unit of work in a workflow
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn contract(&self) -> StepContract;

    async fn execute(&self, ctx: &StepContext, input: StepInput) -> WorkflowResult<Vec<EventPayload>>;
}

struct RegisteredStep {
    step: Arc<dyn Step>,
    contract: StepContract,
}

/// A validated set of steps
pub struct WorkflowGraph {
    steps: Vec<RegisteredStep>,
    consumers: HashMap<EventKind, Vec<usize>>,
}

impl WorkflowGraph {
    /// Build and validate a graph. Every structural problem is reported
    /// here, never at runtime.
    pub fn new(steps: Vec<Arc<dyn Step>>) -> WorkflowResult<Self> {
        let registered: Vec<RegisteredStep> = steps
            .into_iter()
            .map(|step| {
                let contract = step.contract();
                RegisteredStep { step, contract }
            })
            .collect();

        let contracts: Vec<(&str, &StepContract)> = registered
            .iter()
            .map(|r| (r.step.name(), &r.contract))
            .collect();
        validate_contracts(&contracts)?;

        let mut consumers: HashMap<EventKind, Vec<usize>> = HashMap::new();
        for (idx, r) in registered.iter().enumerate() {
            for kind in r.contract.consumes.kinds() {
                consumers.entry(kind).or_default().push(idx);
            }
        }

        Ok(Self {
            steps: registered,
            consumers,
        })
    }

    pub fn consumers_of(&self, kind: EventKind) -> &[usize] {
        self.consumers.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn has_consumer(&self, kind: EventKind) -> bool {
        !self.consumers_of(kind).is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|r| r.step.name()).collect()
    }

    fn name(&self, idx: usize) -> &str {
        self.steps[idx].step.name()
    }

    fn contract(&self, idx: usize) -> &StepContract {
        &self.steps[idx].contract
    }
}

/// Check a set of named contracts for structural problems:
/// - a produced kind nobody consumes
/// - a consumed kind nobody produces
/// - a step whose sole input kind equals its sole output kind
pub fn validate_contracts(contracts: &[(&str, &StepContract)]) -> WorkflowResult<()> {
    let mut problems = Vec::new();

    if contracts.is_empty() {
        return Err(WorkflowError::configuration("workflow has no steps"));
    }

    let mut seen = HashSet::new();
    for (name, _) in contracts {
        if !seen.insert(*name) {
            problems.push(format!("duplicate step name '{}'", name));
        }
    }

    // START comes from the environment; system kinds come from the scheduler
    let mut produced: BTreeSet<EventKind> = BTreeSet::new();
    produced.insert(EventKind::START);
    produced.insert(EventKind::StepTimedOut);
    produced.insert(EventKind::StepFailed);

    // TERMINAL is consumed by the scheduler itself
    let mut consumed: BTreeSet<EventKind> = BTreeSet::new();
    consumed.insert(EventKind::TERMINAL);

    for (name, contract) in contracts {
        let inputs = contract.consumes.kinds();
        if inputs.is_empty() {
            problems.push(format!("step '{}' consumes nothing", name));
        }
        if let Consumes::Collect { count: 0, .. } = contract.consumes {
            problems.push(format!("step '{}' collects zero events", name));
        }
        if inputs.contains(&EventKind::TERMINAL) {
            problems.push(format!(
                "step '{}' consumes {}, which is reserved for the scheduler",
                name,
                EventKind::TERMINAL
            ));
        }
        if inputs.len() == 1 && contract.produces.len() == 1 && inputs[0] == contract.produces[0] {
            problems.push(format!(
                "step '{}' consumes and produces only {} (infinite loop)",
                name, inputs[0]
            ));
        }
        consumed.extend(inputs);
        produced.extend(contract.produces.iter().copied());
    }

    for kind in &produced {
        if !consumed.contains(kind) && !kind.is_system() {
            problems.push(format!("event kind {} is produced but never consumed", kind));
        }
    }
    for kind in &consumed {
        if !produced.contains(kind) {
            problems.push(format!("event kind {} is consumed but never produced", kind));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::Configuration(problems.join("; ")))
    }
}

/// Why the drive loop stopped
enum Halt {
    Completed,
    Failed {
        step: Option<String>,
        error: WorkflowError,
        event: Option<String>,
    },
    Aborted(WorkflowError),
}

impl Halt {
    fn failed(step: Option<String>, error: WorkflowError, event: Option<String>) -> Self {
        Self::Failed { step, error, event }
    }
}

enum StepResult {
    Produced(Vec<EventPayload>),
    TimedOut(Duration),
    Failed { error: WorkflowError, attempts: u32 },
    Cancelled,
}

struct TaskOutcome {
    invocation_id: u64,
    step_idx: usize,
    result: StepResult,
    context_diff: Vec<ContextEntry>,
}

struct Invocation {
    id: u64,
    step_idx: usize,
    input: StepInput,
}

struct Collection {
    events: Vec<Event>,
    deadline: Option<Instant>,
}

/// Mutable state of one run while the scheduler drives it
struct Execution {
    run: WorkflowRun,
    context: Arc<ContextStore>,
    cancel: CancellationToken,
    queue: VecDeque<Event>,
    collections: HashMap<usize, Collection>,
    waiting: VecDeque<Invocation>,
    in_flight: HashMap<u64, Invocation>,
    tasks: JoinSet<TaskOutcome>,
    cursors: HashMap<EventKind, usize>,
    next_sequence: u64,
    next_invocation: u64,
    tracker: SafetyTracker,
    terminal: bool,
}

impl Execution {
    fn new(run: WorkflowRun, context: Arc<ContextStore>, cancel: CancellationToken) -> Self {
        Self {
            run,
            context,
            cancel,
            queue: VecDeque::new(),
            collections: HashMap::new(),
            waiting: VecDeque::new(),
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            cursors: HashMap::new(),
            next_sequence: 0,
            next_invocation: 0,
            tracker: SafetyTracker::new(),
            terminal: false,
        }
    }

    fn enqueue_invocation(&mut self, step_idx: usize, input: StepInput) {
        let id = self.next_invocation;
        self.next_invocation += 1;
        self.waiting.push_back(Invocation {
            id,
            step_idx,
            input,
        });
    }

    /// Round-robin over competing consumers of the same kind
    fn next_consumer(&mut self, kind: EventKind, consumers: &[usize]) -> usize {
        let cursor = self.cursors.entry(kind).or_insert(0);
        let idx = consumers[*cursor % consumers.len()];
        *cursor += 1;
        idx
    }

    fn earliest_collection_deadline(&self) -> Option<Instant> {
        self.collections.values().filter_map(|c| c.deadline).min()
    }

    /// Produced but not yet fully handled events, in sequence order
    fn pending_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.queue.iter().cloned().collect();
        events.extend(self.collections.values().flat_map(|c| c.events.iter().cloned()));
        events.extend(self.waiting.iter().flat_map(|i| i.input.events().to_vec()));
        events.extend(self.in_flight.values().flat_map(|i| i.input.events().to_vec()));
        events.sort_by_key(|e| e.sequence);
        events
    }
}

/// Drives a validated workflow graph for one run at a time
pub struct StepScheduler {
    graph: Arc<WorkflowGraph>,
    limits: SafetyLimits,
    retry: RetryPolicy,
    audit: Arc<dyn AuditSink>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    run_store: Option<Arc<RunStore>>,
}

impl StepScheduler {
    pub fn new(
        graph: WorkflowGraph,
        limits: SafetyLimits,
        retry: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            limits,
            retry,
            audit,
            checkpoints: None,
            run_store: None,
        }
    }

    /// Emit a checkpoint after every completed step
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Persist the event log and run record to a run directory
    pub fn with_run_store(mut self, store: Arc<RunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Run a workflow from its start event to a terminal status.
    ///
    /// Returns `Err` only when the final audit record or run state cannot
    /// be persisted; every workflow failure is reported in the run status.
    #[instrument(skip(self, context, start, cancel), fields(run_id = %run_id))]
    pub async fn run(
        &self,
        run_id: Uuid,
        context: Arc<ContextStore>,
        start: EventPayload,
        cancel: CancellationToken,
    ) -> WorkflowResult<WorkflowRun> {
        if start.kind() != EventKind::START {
            return Err(WorkflowError::Configuration(format!(
                "runs must start with {}, got {}",
                EventKind::START,
                start.kind()
            )));
        }

        let mut run = WorkflowRun::new(run_id);
        run.start();
        info!(steps = self.graph.steps.len(), "Starting workflow run");

        let mut exec = Execution::new(run, context, cancel.child_token());
        let halt = match self.emit(&mut exec, None, start).await {
            Ok(()) => self.drive(&mut exec).await,
            Err(halt) => halt,
        };
        self.finish(exec, halt).await
    }

    /// Continue a run from its latest checkpoint
    #[instrument(skip(self, checkpoint, context, cancel), fields(run_id = %checkpoint.run_id, step = %checkpoint.step_name))]
    pub async fn resume(
        &self,
        checkpoint: Checkpoint,
        context: Arc<ContextStore>,
        cancel: CancellationToken,
    ) -> WorkflowResult<WorkflowRun> {
        self.restore_context(&checkpoint, &context).await?;

        let mut run = WorkflowRun::new(checkpoint.run_id);
        run.start();
        run.current_step = Some(checkpoint.step_name);
        run.event_log = checkpoint.event_log;

        let mut exec = Execution::new(run, context, cancel.child_token());
        exec.queue = checkpoint.pending.into();
        exec.next_sequence = checkpoint.next_sequence;
        exec.tracker.step_executions = checkpoint.step_executions;
        info!(pending = exec.queue.len(), "Resuming workflow run from checkpoint");

        let halt = self.drive(&mut exec).await;
        self.finish(exec, halt).await
    }

    /// Keep every write committed since the checkpoint; refill only keys
    /// the live store lost, numbered past anything already audited
    async fn restore_context(&self, checkpoint: &Checkpoint, context: &ContextStore) -> WorkflowResult<()> {
        let mut audited: BTreeMap<String, u64> = BTreeMap::new();
        for record in self.audit.records_for_run(checkpoint.run_id).await? {
            if let AuditEntry::ContextWrite { key, new_version, .. } = record.entry {
                let last = audited.entry(key).or_default();
                *last = (*last).max(new_version);
            }
        }

        let restored = context
            .restore_missing(checkpoint.context_snapshot.clone(), &audited)
            .await?;
        if restored.is_empty() {
            return Ok(());
        }

        warn!(keys = restored.len(), "Live context was missing checkpointed keys");
        let record = AuditRecord::new(
            checkpoint.run_id,
            "scheduler",
            AuditEntry::ContextRestored {
                checkpoint_step: checkpoint.step_name.clone(),
                entries: restored,
            },
        );
        self.audit.append(&record).await?;
        Ok(())
    }

    async fn drive(&self, exec: &mut Execution) -> Halt {
        let run_timeout = self.limits.run_timeout();
        let run_deadline = Instant::now() + run_timeout.saturating_sub(exec.tracker.elapsed());
        let cancel = exec.cancel.clone();

        loop {
            if let Err(halt) = self.dispatch(exec) {
                return halt;
            }
            if exec.terminal {
                return Halt::Completed;
            }
            if let Err(halt) = self.launch_ready(exec) {
                return halt;
            }

            let next_collection = exec.earliest_collection_deadline();
            if exec.tasks.is_empty() && next_collection.is_none() {
                let pending: Vec<String> = exec.pending_events().iter().map(Event::summary).collect();
                return Halt::failed(
                    None,
                    WorkflowError::WorkflowStalled(format!(
                        "no runnable step and no terminal event (pending: [{}])",
                        pending.join(", ")
                    )),
                    None,
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Halt::Aborted(WorkflowError::Cancelled);
                }
                _ = tokio::time::sleep_until(run_deadline) => {
                    return Halt::Aborted(WorkflowError::RunTimeout(run_timeout));
                }
                Some(joined) = exec.tasks.join_next(), if !exec.tasks.is_empty() => {
                    if let Err(halt) = self.handle_joined(exec, joined).await {
                        return halt;
                    }
                }
                _ = tokio::time::sleep_until(next_collection.unwrap_or(run_deadline)), if next_collection.is_some() => {
                    self.fire_expired_collections(exec);
                }
            }
        }
    }

    /// Route queued events to their consumers
    fn dispatch(&self, exec: &mut Execution) -> Result<(), Halt> {
        while let Some(event) = exec.queue.pop_front() {
            let kind = event.kind();

            if kind == EventKind::TERMINAL {
                if exec.terminal {
                    return Err(Halt::failed(
                        event.produced_by.clone(),
                        WorkflowError::configuration("more than one terminal event reached the scheduler"),
                        Some(event.summary()),
                    ));
                }
                exec.run.record_consumed(event.id, "scheduler");
                exec.terminal = true;
                continue;
            }

            let consumers = self.graph.consumers_of(kind);
            if consumers.is_empty() {
                return Err(Halt::failed(
                    event.produced_by.clone(),
                    WorkflowError::Configuration(format!("no consumer for {}", kind)),
                    Some(event.summary()),
                ));
            }

            let idx = exec.next_consumer(kind, consumers);
            let name = self.graph.name(idx).to_string();
            exec.run.record_consumed(event.id, &name);
            debug!(step = %name, event = %event.summary(), "Event claimed");

            match self.graph.contract(idx).consumes {
                Consumes::Each(_) => exec.enqueue_invocation(idx, StepInput::Event(event)),
                Consumes::Collect { count, timeout, .. } => {
                    let timeout = timeout.unwrap_or_else(|| self.limits.collect_timeout());
                    let collection = exec.collections.entry(idx).or_insert_with(|| Collection {
                        events: Vec::new(),
                        deadline: None,
                    });
                    if collection.deadline.is_none() {
                        collection.deadline = Some(Instant::now() + timeout);
                    }
                    collection.events.push(event);

                    if collection.events.len() >= count {
                        if let Some(done) = exec.collections.remove(&idx) {
                            debug!(step = %name, count, "Collection complete");
                            exec.enqueue_invocation(idx, StepInput::Collected(done.events));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn waiting invocations whose write sets don't overlap running steps
    fn launch_ready(&self, exec: &mut Execution) -> Result<(), Halt> {
        let mut blocked_steps = HashSet::new();
        let mut still_waiting = VecDeque::new();

        while let Some(invocation) = exec.waiting.pop_front() {
            let writes = &self.graph.contract(invocation.step_idx).writes;
            let conflicts = exec.in_flight.values().any(|running| {
                self.graph
                    .contract(running.step_idx)
                    .writes
                    .iter()
                    .any(|key| writes.contains(key))
            });

            // Keep per-step order: once one invocation waits, later ones wait too
            if conflicts || blocked_steps.contains(&invocation.step_idx) {
                blocked_steps.insert(invocation.step_idx);
                still_waiting.push_back(invocation);
                continue;
            }

            if let Err(violation) = self.limits.check(&exec.tracker) {
                let name = self.graph.name(invocation.step_idx).to_string();
                let summary = invocation.input.summary();
                exec.waiting = still_waiting;
                return Err(Halt::failed(Some(name), violation.into(), Some(summary)));
            }
            exec.tracker.record_execution();
            self.spawn(exec, invocation);
        }

        exec.waiting = still_waiting;
        Ok(())
    }

    fn spawn(&self, exec: &mut Execution, invocation: Invocation) {
        let registered = &self.graph.steps[invocation.step_idx];
        let step = Arc::clone(&registered.step);
        let timeout = registered.contract.timeout.unwrap_or_else(|| self.limits.step_timeout());
        let retry = self.retry.clone();

        let ctx = StepContext {
            run_id: exec.run.id,
            step: step.name().to_string(),
            context: Arc::clone(&exec.context),
            audit: Arc::clone(&self.audit),
            cancel: exec.cancel.child_token(),
        };

        let input = invocation.input.clone();
        let invocation_id = invocation.id;
        let step_idx = invocation.step_idx;

        exec.run.current_step = Some(ctx.step.clone());
        exec.in_flight.insert(invocation.id, invocation);

        exec.tasks.spawn(async move {
            let before = ctx.context.snapshot().await;
            let result = execute_step(step.as_ref(), &ctx, input, &retry, timeout).await;
            let context_diff = ctx
                .context
                .diff_since(&before)
                .await
                .into_iter()
                .filter(|entry| entry.writer == ctx.step)
                .collect();

            TaskOutcome {
                invocation_id,
                step_idx,
                result,
                context_diff,
            }
        });
    }

    async fn handle_joined(
        &self,
        exec: &mut Execution,
        joined: Result<TaskOutcome, JoinError>,
    ) -> Result<(), Halt> {
        let outcome = joined.map_err(|e| {
            Halt::failed(
                None,
                WorkflowError::Storage(anyhow::anyhow!("step task panicked: {}", e)),
                None,
            )
        })?;

        let name = self.graph.name(outcome.step_idx).to_string();
        let invocation = exec.in_flight.remove(&outcome.invocation_id);
        let input_summary = invocation.as_ref().map(|i| i.input.summary());

        match outcome.result {
            StepResult::Produced(payloads) => {
                let declared = &self.graph.contract(outcome.step_idx).produces;
                if let Some(bad) = payloads.iter().find(|p| !declared.contains(&p.kind())) {
                    return Err(Halt::failed(
                        Some(name.clone()),
                        WorkflowError::Configuration(format!(
                            "step '{}' produced undeclared event kind {}",
                            name,
                            bad.kind()
                        )),
                        input_summary,
                    ));
                }

                for payload in payloads {
                    self.emit(exec, Some(&name), payload).await?;
                }

                let input = invocation.map(|i| i.input.into_events()).unwrap_or_default();
                self.checkpoint(exec, &name, input, outcome.context_diff).await
            }
            StepResult::TimedOut(after) => {
                let error = WorkflowError::StepTimeout {
                    step: name.clone(),
                    after,
                };
                if !self.graph.has_consumer(EventKind::StepTimedOut) {
                    return Err(Halt::failed(Some(name), error, input_summary));
                }
                self.audit_step_failure(exec.run.id, &name, &error, input_summary)
                    .await?;
                self.emit(
                    exec,
                    None,
                    EventPayload::StepTimedOut {
                        step: name,
                        timeout_ms: after.as_millis() as u64,
                    },
                )
                .await
            }
            StepResult::Failed { error, attempts } => {
                error!(step = %name, attempts, error = %error, "Step failed permanently");
                if !self.graph.has_consumer(EventKind::StepFailed) {
                    return Err(Halt::failed(Some(name), error, input_summary));
                }
                self.audit_step_failure(exec.run.id, &name, &error, input_summary)
                    .await?;
                self.emit(
                    exec,
                    None,
                    EventPayload::StepFailed {
                        step: name,
                        code: error.code().to_string(),
                        error: error.to_string(),
                    },
                )
                .await
            }
            StepResult::Cancelled => Err(Halt::Aborted(WorkflowError::Cancelled)),
        }
    }

    fn fire_expired_collections(&self, exec: &mut Execution) {
        let now = Instant::now();
        let expired: Vec<usize> = exec
            .collections
            .iter()
            .filter(|(_, c)| c.deadline.map_or(false, |d| d <= now))
            .map(|(idx, _)| *idx)
            .collect();

        for idx in expired {
            if let Some(collection) = exec.collections.remove(&idx) {
                let expected = match self.graph.contract(idx).consumes {
                    Consumes::Collect { count, .. } => count,
                    Consumes::Each(_) => 1,
                };
                warn!(
                    step = %self.graph.name(idx),
                    received = collection.events.len(),
                    expected,
                    "Collection timed out"
                );
                exec.enqueue_invocation(
                    idx,
                    StepInput::CollectionTimedOut {
                        received: collection.events,
                        expected,
                    },
                );
            }
        }
    }

    async fn emit(
        &self,
        exec: &mut Execution,
        producer: Option<&str>,
        payload: EventPayload,
    ) -> Result<(), Halt> {
        let event = Event::new(
            exec.run.id,
            exec.next_sequence,
            producer.map(str::to_string),
            payload,
        );
        exec.next_sequence += 1;

        if let Some(ref store) = self.run_store {
            store.append_event(&event).await.map_err(|e| {
                Halt::failed(producer.map(str::to_string), WorkflowError::Storage(e), Some(event.summary()))
            })?;
        }

        exec.run.record_produced(&event);
        exec.queue.push_back(event);
        Ok(())
    }

    async fn checkpoint(
        &self,
        exec: &mut Execution,
        step_name: &str,
        input: Vec<Event>,
        context_diff: Vec<ContextEntry>,
    ) -> Result<(), Halt> {
        let Some(ref store) = self.checkpoints else {
            return Ok(());
        };

        let checkpoint = Checkpoint {
            run_id: exec.run.id,
            step_name: step_name.to_string(),
            input,
            context_diff,
            context_snapshot: exec.context.snapshot().await,
            pending: exec.pending_events(),
            event_log: exec.run.event_log.clone(),
            next_sequence: exec.next_sequence,
            step_executions: exec.tracker.step_executions,
            created_at: Utc::now(),
        };

        store
            .save(exec.run.id, step_name, &checkpoint)
            .await
            .map_err(|e| Halt::failed(Some(step_name.to_string()), e, None))?;

        if let Some(ref run_store) = self.run_store {
            let record = exec
                .run
                .to_record(checkpoint.context_snapshot, self.audit.location());
            run_store
                .save_record(&record)
                .await
                .map_err(|e| Halt::failed(Some(step_name.to_string()), WorkflowError::Storage(e), None))?;
        }

        debug!(step = step_name, sequence = exec.next_sequence, "Checkpoint saved");
        Ok(())
    }

    async fn audit_step_failure(
        &self,
        run_id: Uuid,
        step: &str,
        error: &WorkflowError,
        event: Option<String>,
    ) -> Result<(), Halt> {
        let record = AuditRecord::new(
            run_id,
            step,
            AuditEntry::StepFailed {
                step: step.to_string(),
                code: error.code().to_string(),
                error: error.to_string(),
                event,
            },
        );
        self.audit
            .append(&record)
            .await
            .map_err(|e| Halt::failed(Some(step.to_string()), WorkflowError::Storage(e), None))
    }

    /// Stop in-flight work, write the terminal audit records and run state
    async fn finish(&self, mut exec: Execution, halt: Halt) -> WorkflowResult<WorkflowRun> {
        exec.cancel.cancel();
        exec.tasks.abort_all();
        while exec.tasks.join_next().await.is_some() {}

        let run_id = exec.run.id;
        let status = match halt {
            Halt::Completed => {
                let unconsumed = exec.queue.len();
                if unconsumed > 0 {
                    warn!(unconsumed, "Events left unconsumed after terminal event");
                }
                info!(events = exec.run.event_log.len(), "Workflow run completed");
                self.append(run_id, "scheduler", AuditEntry::RunCompleted {
                    status: "completed".to_string(),
                })
                .await?;
                RunStatus::Completed
            }
            Halt::Failed { step, error, event } => {
                error!(step = ?step, code = error.code(), error = %error, "Workflow run failed");
                if let Some(ref step) = step {
                    self.append(run_id, step, AuditEntry::StepFailed {
                        step: step.clone(),
                        code: error.code().to_string(),
                        error: error.to_string(),
                        event: event.clone(),
                    })
                    .await?;
                }
                let mut report = FailureReport::new(run_id, step, &error);
                if let Some(event) = event {
                    report = report.with_event(event);
                }
                self.append(run_id, "scheduler", AuditEntry::RunFailed {
                    report: report.clone(),
                })
                .await?;
                RunStatus::Failed { report }
            }
            Halt::Aborted(error) => {
                let reason = error.to_string();
                warn!(%reason, "Workflow run aborted");
                let snapshot = exec.context.snapshot().await;
                self.append(run_id, "scheduler", AuditEntry::RunAborted {
                    reason: reason.clone(),
                    context_keys: snapshot.keys().cloned().collect(),
                    pending_events: exec.pending_events().iter().map(Event::summary).collect(),
                })
                .await?;
                RunStatus::Aborted { reason }
            }
        };

        exec.run.finish(status);

        if let Some(ref store) = self.run_store {
            let record = exec
                .run
                .to_record(exec.context.snapshot().await, self.audit.location());
            store.save_record(&record).await?;
        }

        Ok(exec.run)
    }

    async fn append(&self, run_id: Uuid, actor: &str, entry: AuditEntry) -> WorkflowResult<()> {
        self.audit
            .append(&AuditRecord::new(run_id, actor, entry))
            .await?;
        Ok(())
    }
}

/// One execution with retry, timeout and cancellation
async fn execute_step(
    step: &dyn Step,
    ctx: &StepContext,
    input: StepInput,
    retry: &RetryPolicy,
    timeout: Duration,
) -> StepResult {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return StepResult::Cancelled,
            outcome = tokio::time::timeout(timeout, step.execute(ctx, input.clone())) => outcome,
        };

        match outcome {
            Err(_) => {
                warn!(step = %ctx.step, timeout_ms = timeout.as_millis() as u64, "Step timed out");
                return StepResult::TimedOut(timeout);
            }
            Ok(Ok(payloads)) => {
                debug!(
                    step = %ctx.step,
                    attempt,
                    duration_ms = started.elapsed().as_millis() as u64,
                    produced = payloads.len(),
                    "Step completed"
                );
                return StepResult::Produced(payloads);
            }
            Ok(Err(WorkflowError::Cancelled)) => return StepResult::Cancelled,
            Ok(Err(e)) if e.is_retryable() && retry.should_retry(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    step = %ctx.step,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Step failed, retrying"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return StepResult::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(Err(error)) => {
                return StepResult::Failed {
                    error,
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(consumes: EventKind, produces: &[EventKind]) -> StepContract {
        produces
            .iter()
            .fold(StepContract::consumes(consumes), |c, k| c.produces(*k))
    }

    fn linear() -> Vec<(&'static str, StepContract)> {
        vec![
            ("ingestion", contract(EventKind::WorkflowStarted, &[EventKind::DocumentIngested])),
            ("categorization", contract(EventKind::DocumentIngested, &[EventKind::Categorized])),
            ("completion", contract(EventKind::Categorized, &[EventKind::WorkflowCompleted])),
        ]
    }

    fn check(contracts: &[(&'static str, StepContract)]) -> WorkflowResult<()> {
        let refs: Vec<(&str, &StepContract)> = contracts.iter().map(|(n, c)| (*n, c)).collect();
        validate_contracts(&refs)
    }

    fn problem(result: WorkflowResult<()>) -> String {
        match result {
            Err(WorkflowError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_linear_graph_is_valid() {
        assert!(check(&linear()).is_ok());
    }

    #[test]
    fn test_produced_kind_without_consumer_is_rejected() {
        let mut contracts = linear();
        contracts[1].1 = contract(
            EventKind::DocumentIngested,
            &[EventKind::Categorized, EventKind::PlanReady],
        );
        let msg = problem(check(&contracts));
        assert!(msg.contains("plan_ready is produced but never consumed"), "{}", msg);
    }

    #[test]
    fn test_consumed_kind_without_producer_is_rejected() {
        let mut contracts = linear();
        contracts.push(("planning", contract(EventKind::ConsultationCleared, &[EventKind::WorkflowCompleted])));
        let msg = problem(check(&contracts));
        assert!(msg.contains("consultation_cleared is consumed but never produced"), "{}", msg);
    }

    #[test]
    fn test_self_loop_is_rejected() {
        let mut contracts = linear();
        contracts.push(("echo", contract(EventKind::PlanReady, &[EventKind::PlanReady])));
        let msg = problem(check(&contracts));
        assert!(msg.contains("infinite loop"), "{}", msg);
    }

    #[test]
    fn test_self_loop_rule_only_applies_to_sole_input_and_output() {
        let mut contracts = linear();
        // Consumes and produces PlanReady but also produces a second kind
        contracts[2].1 = contract(EventKind::Categorized, &[EventKind::PlanReady]);
        contracts.push((
            "refine",
            contract(EventKind::PlanReady, &[EventKind::PlanReady, EventKind::WorkflowCompleted]),
        ));
        assert!(check(&contracts).is_ok());
    }

    #[test]
    fn test_system_kinds_need_no_consumer() {
        // StepTimedOut and StepFailed are produced implicitly; a graph that
        // never consumes them is still valid
        assert!(check(&linear()).is_ok());

        let mut contracts = linear();
        contracts.push(("recovery", contract(EventKind::StepFailed, &[EventKind::WorkflowCompleted])));
        assert!(check(&contracts).is_ok());
    }

    #[test]
    fn test_terminal_kind_is_reserved() {
        let mut contracts = linear();
        contracts.push(("sink", contract(EventKind::WorkflowCompleted, &[])));
        let msg = problem(check(&contracts));
        assert!(msg.contains("reserved for the scheduler"), "{}", msg);
    }

    #[test]
    fn test_missing_terminal_producer_is_rejected() {
        let contracts = vec![
            ("ingestion", contract(EventKind::WorkflowStarted, &[EventKind::DocumentIngested])),
            ("categorization", contract(EventKind::DocumentIngested, &[])),
        ];
        let msg = problem(check(&contracts));
        assert!(msg.contains("workflow_completed is consumed but never produced"), "{}", msg);
    }

    #[test]
    fn test_collect_contract_validation() {
        let mut contracts = linear();
        contracts[2].1 = contract(EventKind::Categorized, &[EventKind::AgentResponded]);
        contracts.push((
            "aggregation",
            StepContract::collect(EventKind::AgentResponded, 0).produces(EventKind::WorkflowCompleted),
        ));
        let msg = problem(check(&contracts));
        assert!(msg.contains("collects zero events"), "{}", msg);
    }

    #[test]
    fn test_step_input_summary() {
        let event = Event::new(
            Uuid::new_v4(),
            7,
            Some("planning".into()),
            EventPayload::WorkflowCompleted { summary: "ok".into() },
        );
        let input = StepInput::CollectionTimedOut {
            received: vec![event],
            expected: 3,
        };
        assert_eq!(
            input.summary(),
            "[#7 workflow_completed from planning] (timed out, expected 3)"
        );
    }
}
