//! File-based human-decision inbox.
//!
//! A pending consultation is published as `<id>.request.json` in the run's
//! `decisions/` directory. A reviewer (usually via `gampflow decide`)
//! answers by writing `<id>.json`, which the waiting run picks up on its
//! next poll.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use super::HumanDecisionSource;
use crate::domain::{ConsultationRequest, HumanDecision};
use crate::error::WorkflowResult;

/// Polls a directory for decision files
pub struct DecisionInbox {
    dir: PathBuf,
    poll_interval: Duration,
}

impl DecisionInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn request_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.request.json", id))
    }

    fn decision_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Publish a request so reviewers can find it
    pub async fn publish(&self, request: &ConsultationRequest) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create decisions directory: {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(request).context("Failed to serialize consultation request")?;
        write_atomic(&self.request_path(request.id), &json).await
    }

    /// Record a reviewer's decision
    pub async fn submit(&self, decision: &HumanDecision) -> anyhow::Result<()> {
        let request_path = self.request_path(decision.consultation_id);
        if !request_path.exists() {
            anyhow::bail!(
                "No pending consultation {} in {}",
                decision.consultation_id,
                self.dir.display()
            );
        }

        let json = serde_json::to_string_pretty(decision).context("Failed to serialize decision")?;
        write_atomic(&self.decision_path(decision.consultation_id), &json).await?;
        info!(consultation_id = %decision.consultation_id, actor = %decision.actor, "Decision submitted");
        Ok(())
    }

    /// Published requests that have no decision yet
    pub async fn pending(&self) -> anyhow::Result<Vec<ConsultationRequest>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut pending = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_request = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".request.json"));
            if !is_request {
                continue;
            }

            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let request: ConsultationRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            if !self.decision_path(request.id).exists() {
                pending.push(request);
            }
        }

        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn read_decision(&self, id: Uuid) -> anyhow::Result<Option<HumanDecision>> {
        let path = self.decision_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read decision: {}", path.display()))?;
        let decision = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse decision: {}", path.display()))?;
        Ok(Some(decision))
    }
}

async fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to commit {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl HumanDecisionSource for DecisionInbox {
    async fn await_decision(&self, request: &ConsultationRequest) -> WorkflowResult<HumanDecision> {
        self.publish(request).await?;
        info!(
            consultation_id = %request.id,
            reason = %request.reason,
            inbox = %self.dir.display(),
            "Waiting for human decision"
        );

        loop {
            if let Some(decision) = self.read_decision(request.id).await? {
                return Ok(decision);
            }
            debug!(consultation_id = %request.id, "No decision yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CategorizationResult, ConsultationReason, GampCategory, HumanVerdict, Urgency,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn request() -> ConsultationRequest {
        ConsultationRequest {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            reason: ConsultationReason::HighRiskCategory,
            reasons: vec![ConsultationReason::HighRiskCategory],
            required_expertise: vec!["validation_lead".to_string()],
            urgency: Urgency::High,
            triggering_step: "consultation_gate".to_string(),
            categorization: CategorizationResult {
                predicted: GampCategory::Category5,
                confidence: 0.9,
                ambiguous: false,
                dominance_gap: 0.9,
                signals: BTreeMap::new(),
                raw_scores: BTreeMap::new(),
                authoritative_scores: BTreeMap::new(),
                risk_flag: false,
                rationale: None,
            },
            created_at: Utc::now(),
        }
    }

    fn approve(id: Uuid) -> HumanDecision {
        HumanDecision {
            consultation_id: id,
            verdict: HumanVerdict::Approve,
            actor: "qa-lead".to_string(),
            category: None,
            comment: None,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_await_picks_up_submitted_decision() {
        let temp = TempDir::new().unwrap();
        let inbox = Arc::new(
            DecisionInbox::new(temp.path().join("decisions"))
                .with_poll_interval(Duration::from_millis(10)),
        );
        let request = request();

        let waiter = {
            let inbox = inbox.clone();
            let request = request.clone();
            tokio::spawn(async move { inbox.await_decision(&request).await })
        };

        // Wait for the request to be published
        while inbox.pending().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        inbox.submit(&approve(request.id)).await.unwrap();
        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision.verdict, HumanVerdict::Approve);
        assert!(inbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_requires_pending_request() {
        let temp = TempDir::new().unwrap();
        let inbox = DecisionInbox::new(temp.path());
        assert!(inbox.submit(&approve(Uuid::new_v4())).await.is_err());
    }
}
