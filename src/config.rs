//! Configuration for gampflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GAMPFLOW_HOME)
//! 2. Config file (.gampflow/config.yaml)
//! 3. Defaults (~/.gampflow and the documented policy defaults)
//!
//! Config file discovery:
//! - Searches current directory and parents for .gampflow/config.yaml
//! - `paths.home` in the config file is relative to the .gampflow/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::categorization::CategorizationPolicy;
use crate::core::consultation::ConsultationPolicy;
use crate::core::coordinator::CoordinatorConfig;
use crate::core::retry::RetryPolicy;
use crate::core::safety::SafetyLimits;
use crate::error::{WorkflowError, WorkflowResult};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(flatten)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .gampflow/)
    pub home: Option<String>,
}

/// An external program speaking the oracle JSON protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,
}

fn default_command_timeout() -> u64 {
    120
}

impl CommandSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Programs backing the classifier, generator and specialist agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OraclesConfig {
    #[serde(default)]
    pub classifier: Option<CommandSpec>,

    #[serde(default)]
    pub generator: Option<CommandSpec>,

    /// Keyed by agent id
    #[serde(default)]
    pub agents: BTreeMap<String, CommandSpec>,
}

/// Immutable policy for a workflow run
///
/// Built once before a run starts; nothing mutates it mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub categorization: CategorizationPolicy,

    #[serde(default)]
    pub consultation: ConsultationPolicy,

    #[serde(default)]
    pub coordination: CoordinatorConfig,

    #[serde(default)]
    pub limits: SafetyLimits,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Save a checkpoint after every completed step
    #[serde(default = "default_checkpoints")]
    pub checkpoints: bool,

    #[serde(default)]
    pub oracles: OraclesConfig,
}

fn default_checkpoints() -> bool {
    true
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            categorization: CategorizationPolicy::default(),
            consultation: ConsultationPolicy::default(),
            coordination: CoordinatorConfig::default(),
            limits: SafetyLimits::default(),
            retry: RetryPolicy::default(),
            checkpoints: default_checkpoints(),
            oracles: OraclesConfig::default(),
        }
    }
}

impl WorkflowConfig {
    /// Reject inconsistent policy before any run starts
    pub fn validate(&self) -> WorkflowResult<()> {
        self.categorization.validate()?;
        self.consultation.validate()?;
        self.coordination.validate()?;

        let limits = &self.limits;
        if limits.max_step_executions == 0 {
            return Err(WorkflowError::configuration(
                "limits.max_step_executions must be at least 1",
            ));
        }
        if limits.step_timeout_seconds == 0
            || limits.collect_timeout_seconds == 0
            || limits.run_timeout_seconds == 0
        {
            return Err(WorkflowError::configuration("limits timeouts must be positive"));
        }
        for pattern in &limits.denylist_patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                WorkflowError::Configuration(format!("invalid denylist pattern '{}': {}", pattern, e))
            })?;
        }

        if self.retry.max_attempts == 0 {
            return Err(WorkflowError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(WorkflowError::configuration(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }

        Ok(())
    }

    /// Validate plus require a program for every oracle and agent
    pub fn validate_oracles(&self) -> WorkflowResult<()> {
        if self.oracles.classifier.is_none() {
            return Err(WorkflowError::configuration("oracles.classifier is not configured"));
        }
        if self.oracles.generator.is_none() {
            return Err(WorkflowError::configuration("oracles.generator is not configured"));
        }
        for agent in &self.coordination.agents {
            if !self.oracles.agents.contains_key(agent) {
                return Err(WorkflowError::Configuration(format!(
                    "coordination agent '{}' has no entry under oracles.agents",
                    agent
                )));
            }
        }
        Ok(())
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to gampflow home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub workflow: WorkflowConfig,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".gampflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".gampflow");

    let config_file = find_config_file();

    let (home, workflow) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let home = if let Ok(env_home) = std::env::var("GAMPFLOW_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            let gampflow_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(gampflow_dir, home_path)
        } else {
            default_home
        };

        (home, config.workflow)
    } else {
        let home = std::env::var("GAMPFLOW_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        (home, WorkflowConfig::default())
    };

    // The bare default has no agents; runs reject it when they start
    if let Some(ref path) = config_file {
        workflow
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {}: {}", path.display(), e))?;
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        workflow,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the gampflow home directory (engine state)
pub fn gampflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($GAMPFLOW_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}
