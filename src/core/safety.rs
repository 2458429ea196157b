//! Safety limits and enforcement for workflow runs.
//!
//! Prevents runaway execution through configurable limits on:
//! - Number of step executions per run
//! - Document size
//! - Step, collection and run timeouts
//! - Denylisted document source paths (to avoid processing secrets)

use std::path::Path;
use std::time::{Duration, Instant};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Safety limits for a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of step executions per run (default: 100)
    #[serde(default = "default_max_step_executions")]
    pub max_step_executions: u32,

    /// Maximum document size in bytes (default: 10MB)
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,

    /// Per-step timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Per-collection timeout in seconds, measured from the first arrival (default: 600)
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Glob patterns to reject (documents read from these paths won't be processed)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_step_executions() -> u32 {
    100
}
fn default_max_document_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_step_timeout() -> u64 {
    300
} // 5 min
fn default_collect_timeout() -> u64 {
    600
} // 10 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_step_executions: default_max_step_executions(),
            max_document_bytes: default_max_document_bytes(),
            step_timeout_seconds: default_step_timeout(),
            collect_timeout_seconds: default_collect_timeout(),
            run_timeout_seconds: default_run_timeout(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Check if a document path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Validate a document against size limits and denylist
    pub fn validate_document(
        &self,
        content: &str,
        source_path: Option<&Path>,
    ) -> Result<(), SafetyViolation> {
        let size = content.len() as u64;
        if size > self.max_document_bytes {
            return Err(SafetyViolation::MaxDocumentBytes {
                actual: size,
                limit: self.max_document_bytes,
            });
        }

        if let Some(path) = source_path {
            let path_str = path.to_string_lossy();
            if self.is_denylisted(&path_str) {
                return Err(SafetyViolation::DenylistMatch {
                    path: path_str.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Check current tracker state against limits
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        if tracker.step_executions >= self.max_step_executions {
            return Err(SafetyViolation::MaxStepExecutions {
                actual: tracker.step_executions,
                limit: self.max_step_executions,
            });
        }

        Ok(())
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// Step executions dispatched. Transient retries inside one execution
    /// are not counted.
    pub step_executions: u32,

    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    pub fn new() -> Self {
        Self {
            step_executions: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_execution(&mut self) {
        self.step_executions += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Maximum step executions exceeded: {actual} >= {limit}")]
    MaxStepExecutions { actual: u32, limit: u32 },

    #[error("Maximum document bytes exceeded: {actual} > {limit}")]
    MaxDocumentBytes { actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_step_executions, 100);
        assert_eq!(limits.max_document_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.step_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_denylist_matching() {
        let limits = SafetyLimits::default();

        assert!(limits.is_denylisted(".env"));
        assert!(limits.is_denylisted("config/secrets.json"));
        assert!(limits.is_denylisted("certs/server.pem"));

        assert!(!limits.is_denylisted("specs/urs-lims.md"));
    }

    #[test]
    fn test_document_validation() {
        let limits = SafetyLimits {
            max_document_bytes: 100,
            ..Default::default()
        };

        assert!(limits.validate_document("short", None).is_ok());

        let long = "x".repeat(200);
        let result = limits.validate_document(&long, None);
        assert!(matches!(result, Err(SafetyViolation::MaxDocumentBytes { .. })));

        let result = limits.validate_document("short", Some(Path::new("keys/prod.key")));
        assert!(matches!(result, Err(SafetyViolation::DenylistMatch { .. })));
    }

    #[test]
    fn test_tracker_step_counting() {
        let limits = SafetyLimits {
            max_step_executions: 2,
            ..Default::default()
        };

        let mut tracker = SafetyTracker::new();
        assert!(limits.check(&tracker).is_ok());

        tracker.record_execution();
        assert!(limits.check(&tracker).is_ok());

        tracker.record_execution();
        let result = limits.check(&tracker);
        assert!(matches!(result, Err(SafetyViolation::MaxStepExecutions { .. })));
    }
}
