//! Command-line interface for gampflow.
//!
//! Provides commands for running the categorization workflow, checking
//! status, listing and resuming runs, reading the audit trail, and
//! answering pending consultations.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config;
use crate::core::steps::KEY_ARTIFACT;
use crate::core::{RunHistory, WorkflowOrchestrator};
use crate::domain::{
    AuditEntry, Document, GampCategory, GeneratedArtifact, HumanDecision, HumanVerdict, RunRecord,
    RunStatus, WorkflowRun,
};

/// gampflow - Event-driven GAMP categorization workflow engine
#[derive(Parser, Debug)]
#[command(name = "gampflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Categorize a document and generate its validation artifact
    Run {
        /// Document file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Document name (defaults to the file stem)
        #[arg(short, long)]
        name: Option<String>,

        /// Read the document from stdin
        #[arg(long)]
        stdin: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Resume a failed or interrupted run from its latest checkpoint
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Show the audit trail of a run
    Audit {
        /// Run ID (UUID)
        run_id: String,

        /// Print raw JSON records
        #[arg(long)]
        json: bool,
    },

    /// List consultations waiting for a human decision
    Pending {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Answer a pending consultation
    Decide {
        /// Run ID (UUID)
        run_id: String,

        /// Consultation ID (UUID)
        consultation_id: String,

        #[arg(value_enum)]
        verdict: VerdictArg,

        /// Replacement GAMP category (required for modify)
        #[arg(short, long)]
        category: Option<u8>,

        /// Who is deciding
        #[arg(short, long, env = "GAMPFLOW_ACTOR")]
        actor: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Human verdict for CLI (maps to HumanVerdict)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VerdictArg {
    Approve,
    Reject,
    Modify,
}

impl From<VerdictArg> for HumanVerdict {
    fn from(v: VerdictArg) -> Self {
        match v {
            VerdictArg::Approve => HumanVerdict::Approve,
            VerdictArg::Reject => HumanVerdict::Reject,
            VerdictArg::Modify => HumanVerdict::Modify,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { input, name, stdin } => run_workflow(input, name, stdin).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Audit { run_id, json } => show_audit(&run_id, json).await,
            Commands::Pending { run_id } => list_pending(&run_id).await,
            Commands::Decide {
                run_id,
                consultation_id,
                verdict,
                category,
                actor,
                comment,
            } => decide(&run_id, &consultation_id, verdict, category, actor, comment).await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

fn orchestrator() -> Result<WorkflowOrchestrator> {
    let cfg = config::config()?;
    let orchestrator = WorkflowOrchestrator::from_config(cfg.workflow.clone(), config::runs_dir()?)?;

    // Ctrl-C aborts the run at its next suspension point
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Interrupted, aborting run]");
            cancel.cancel();
        }
    });

    Ok(orchestrator)
}

fn history() -> Result<RunHistory> {
    Ok(RunHistory::new(config::runs_dir()?))
}

async fn run_workflow(input_file: Option<PathBuf>, name: Option<String>, use_stdin: bool) -> Result<()> {
    let document = if let Some(path) = input_file {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read document: {}", path.display()))?;
        let name = name.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string())
        });
        Document::new(name, content).with_source_path(path)
    } else if use_stdin || !io::stdin().is_terminal() {
        // Read from stdin if --stdin flag or if stdin is piped
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        Document::new(name.unwrap_or_else(|| "stdin".to_string()), buffer)
    } else {
        anyhow::bail!("No document provided. Use --input <file> or pipe to stdin");
    };

    let orchestrator = orchestrator()?;
    let run = orchestrator.run(document).await?;
    report(&orchestrator, &run).await
}

async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let orchestrator = orchestrator()?;
    let run = orchestrator.resume(run_id).await?;
    report(&orchestrator, &run).await
}

/// Print the artifact of a completed run, or why it did not complete
async fn report(orchestrator: &WorkflowOrchestrator, run: &WorkflowRun) -> Result<()> {
    match &run.status {
        RunStatus::Completed => {
            let record = orchestrator.status(run.id).await?;
            if let Some(entry) = record.context_snapshot.get(KEY_ARTIFACT) {
                let artifact: GeneratedArtifact = serde_json::from_value(entry.value.clone())
                    .context("Failed to read generated artifact")?;
                println!("{}", artifact.content);
            }
            eprintln!("\n[Run {} completed successfully]", run.id);
        }
        RunStatus::Failed { report } => {
            eprintln!("\n[Run {} failed: {} ({})]", run.id, report.message, report.code);
            if let Some(ref step) = report.step {
                eprintln!("  step:  {}", step);
            }
            if let Some(ref event) = report.event {
                eprintln!("  event: {}", event);
            }
            if let Some(ref diagnostics) = report.diagnostics {
                eprintln!("  oracle output: {}", diagnostics);
            }
            std::process::exit(1);
        }
        RunStatus::Aborted { reason } => {
            eprintln!("\n[Run {} aborted: {}]", run.id, reason);
            std::process::exit(2);
        }
        other => {
            eprintln!("\n[Run {} in state: {}]", run.id, other.label());
        }
    }

    Ok(())
}

async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let record = history()?.status(run_id).await?;
    print_record(&record);
    Ok(())
}

fn print_record(record: &RunRecord) {
    println!("Run ID: {}", record.run_id);
    println!("Status: {}", record.status.label());
    match &record.status {
        RunStatus::Failed { report } => println!("Error: {} ({})", report.message, report.code),
        RunStatus::Aborted { reason } => println!("Reason: {}", reason),
        _ => {}
    }
    println!("Started: {}", record.started_at);
    if let Some(completed) = record.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(ref step) = record.current_step {
        println!("Current step: {}", step);
    }
    println!("Audit log: {}", record.audit_ref);

    println!("\nContext:");
    for (key, entry) in &record.context_snapshot {
        println!("  {:<24} v{:<3} by {}", key, entry.version, entry.writer);
    }

    println!("\nEvents:");
    for entry in &record.event_log {
        println!(
            "  #{:<3} {:<22} {:<18} -> {}",
            entry.sequence,
            entry.kind.as_str(),
            entry.produced_by.as_deref().unwrap_or("(start)"),
            entry.consumed_by.as_deref().unwrap_or("(pending)")
        );
    }
}

async fn list_runs(limit: usize) -> Result<()> {
    let runs = history()?.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<20} {:<25}", "RUN ID", "STATUS", "STEP", "STARTED");
    println!("{}", "-".repeat(95));

    for run in runs {
        println!(
            "{:<38} {:<12} {:<20} {:<25}",
            run.run_id,
            run.status.label(),
            run.current_step.as_deref().unwrap_or("-"),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn show_audit(run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let records = history()?.audit_trail(run_id).await?;

    if records.is_empty() {
        println!("No audit records for run {}", run_id);
        return Ok(());
    }

    for record in records {
        if json {
            println!("{}", serde_json::to_string(&record)?);
            continue;
        }

        let detail = match &record.entry {
            AuditEntry::ContextWrite {
                key,
                prior_version,
                new_version,
            } => match prior_version {
                Some(prior) => format!("{} v{} -> v{}", key, prior, new_version),
                None => format!("{} v{}", key, new_version),
            },
            AuditEntry::ContextRestored {
                checkpoint_step,
                entries,
            } => {
                let keys: Vec<String> = entries
                    .iter()
                    .map(|e| format!("{} v{} -> v{}", e.key, e.checkpoint_version, e.new_version))
                    .collect();
                format!("from {}: {}", checkpoint_step, keys.join(", "))
            }
            AuditEntry::ConsultationTransition { from, to, detail, .. } => match detail {
                Some(detail) => format!("{} -> {} ({})", from, to, detail),
                None => format!("{} -> {}", from, to),
            },
            AuditEntry::ConsultationBypassed {
                justification,
                category,
                confidence,
                ..
            } => format!("{} at {:.2}: {}", category, confidence, justification),
            AuditEntry::StepFailed { step, code, error, .. } => {
                format!("{} {}: {}", step, code, error)
            }
            AuditEntry::RunCompleted { status } => status.clone(),
            AuditEntry::RunFailed { report } => format!("{}: {}", report.code, report.message),
            AuditEntry::RunAborted { reason, pending_events, .. } => {
                format!("{} ({} pending events)", reason, pending_events.len())
            }
        };

        println!(
            "{}  {:<24} {:<18} {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.kind(),
            record.actor,
            detail
        );
    }

    Ok(())
}

async fn list_pending(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let inbox = history()?.decision_inbox(run_id)?;
    let pending = inbox.pending().await?;

    if pending.is_empty() {
        println!("No pending consultations for run {}", run_id);
        return Ok(());
    }

    for request in pending {
        let reasons: Vec<&str> = request.reasons.iter().map(|r| r.as_str()).collect();
        println!("Consultation: {}", request.id);
        println!("  Urgency:    {:?}", request.urgency);
        println!("  Reasons:    {}", reasons.join(", "));
        println!("  Expertise:  {}", request.required_expertise.join(", "));
        println!(
            "  Category:   {} (confidence {:.2})",
            request.categorization.predicted, request.categorization.confidence
        );
        for (category, score) in request.categorization.ranked_scores() {
            println!("    {:<12} {:.2}", category.to_string(), score);
        }
    }

    Ok(())
}

async fn decide(
    run_id_str: &str,
    consultation_id_str: &str,
    verdict: VerdictArg,
    category: Option<u8>,
    actor: String,
    comment: Option<String>,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let consultation_id = Uuid::parse_str(consultation_id_str)
        .with_context(|| format!("Invalid consultation ID: {}", consultation_id_str))?;

    let category = category
        .map(GampCategory::try_from)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    if matches!(verdict, VerdictArg::Modify) && category.is_none() {
        anyhow::bail!("modify requires --category");
    }

    let decision = HumanDecision {
        consultation_id,
        verdict: verdict.into(),
        actor,
        category,
        comment,
        decided_at: Utc::now(),
    };

    history()?.decision_inbox(run_id)?.submit(&decision).await?;
    println!("Decision recorded for consultation {}", consultation_id);
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let workflow = &cfg.workflow;

    println!("gampflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", cfg.home.join("runs").display());
    println!();
    println!("Categorization:");
    println!("  Confidence floor:   {}", workflow.categorization.confidence_floor);
    println!("  Ambiguity gap:      {}", workflow.categorization.dominance_gap_threshold);
    println!();
    println!("Consultation:");
    let high_risk: Vec<String> = workflow
        .consultation
        .high_risk_categories
        .iter()
        .map(|c| c.number().to_string())
        .collect();
    println!("  High-risk categories: {}", high_risk.join(", "));
    println!("  Decision timeout:     {}s", workflow.consultation.decision_timeout_seconds);
    match workflow.consultation.validation_mode {
        Some(ref mode) if mode.enabled => println!("  Validation mode:      ENABLED ({})", mode.justification),
        _ => println!("  Validation mode:      disabled"),
    }
    println!();
    println!("Coordination:");
    println!("  Agents:      {}", workflow.coordination.agents.join(", "));
    println!("  Concurrency: {}", workflow.coordination.max_concurrency);
    println!("  Quorum:      {}", workflow.coordination.required_quorum());
    println!();
    println!("Safety limits:");
    println!("  Max step executions: {}", workflow.limits.max_step_executions);
    println!("  Step timeout:        {}s", workflow.limits.step_timeout_seconds);
    println!("  Run timeout:         {}s", workflow.limits.run_timeout_seconds);
    println!("  Max document size:   {} bytes", workflow.limits.max_document_bytes);

    Ok(())
}
