//! Subprocess oracle using a line-oriented JSON protocol.
//!
//! The configured program receives one JSON request on stdin and must print
//! one JSON response on stdout. Spawn failures, non-zero exits and timeouts
//! are transient; output that is not the expected JSON is a contract error.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{ClassifierOracle, GeneratorOracle, SpecialistAgent};
use crate::domain::{
    AgentRequest, ClassifierResponse, Document, GeneratedArtifact, GenerationContext,
};
use crate::error::{WorkflowError, WorkflowResult};

/// Oracle or agent backed by an external program
#[derive(Debug, Clone)]
pub struct CommandOracle {
    /// Identifier used in logs and as the agent id
    name: String,

    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the program once and return its raw stdout
    async fn call(&self, request: &Value) -> WorkflowResult<String> {
        let operation = format!("{} ({})", self.name, self.program);
        let input = serde_json::to_vec(request)
            .map_err(|e| WorkflowError::Storage(anyhow::Error::new(e).context("Failed to encode oracle request")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkflowError::transient(&operation, format!("failed to spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // Programs that never read their request are still judged by exit status
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(WorkflowError::transient(
                        &operation,
                        format!("failed to write stdin: {}", e),
                    ))
                }
            }
            // Dropping stdin signals EOF
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| WorkflowError::transient(&operation, format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| WorkflowError::transient(&operation, format!("failed to wait: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(WorkflowError::transient(
                &operation,
                format!("exited with code {}: {}", exit_code, stderr.trim()),
            ));
        }

        debug!(oracle = %self.name, bytes = output.stdout.len(), "Oracle responded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Call and parse, mapping protocol violations with `contract_error`
    async fn call_parsed<T, F>(&self, request: Value, contract_error: F) -> WorkflowResult<T>
    where
        T: DeserializeOwned,
        F: Fn(String, Option<String>) -> WorkflowError,
    {
        let stdout = self.call(&request).await?;
        serde_json::from_str(stdout.trim()).map_err(|e| {
            contract_error(
                format!("{} returned malformed JSON: {}", self.name, e),
                Some(truncate(&stdout, 2000)),
            )
        })
    }
}

fn request<T: Serialize>(operation: &str, key: &str, body: &T) -> WorkflowResult<Value> {
    let body = serde_json::to_value(body)
        .map_err(|e| WorkflowError::Storage(anyhow::Error::new(e).context("Failed to encode oracle request")))?;
    let mut request = Map::new();
    request.insert("operation".to_string(), Value::String(operation.to_string()));
    request.insert(key.to_string(), body);
    Ok(Value::Object(request))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[async_trait]
impl ClassifierOracle for CommandOracle {
    async fn classify(&self, document: &Document) -> WorkflowResult<ClassifierResponse> {
        let request = request("classify", "document", document)?;
        self.call_parsed(request, |message, diagnostics| WorkflowError::ClassificationOracle {
            message,
            diagnostics,
        })
        .await
    }
}

#[async_trait]
impl GeneratorOracle for CommandOracle {
    async fn generate(&self, context: &GenerationContext) -> WorkflowResult<GeneratedArtifact> {
        let request = request("generate", "context", context)?;
        let artifact: GeneratedArtifact = self
            .call_parsed(request, |message, diagnostics| WorkflowError::GenerationOracle {
                message,
                diagnostics,
            })
            .await?;

        if artifact.content.trim().is_empty() {
            return Err(WorkflowError::GenerationOracle {
                message: format!("{} returned an empty artifact", self.name),
                diagnostics: None,
            });
        }
        Ok(artifact)
    }
}

#[async_trait]
impl SpecialistAgent for CommandOracle {
    fn id(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, agent_request: &AgentRequest) -> WorkflowResult<Value> {
        let request = request("invoke", "request", agent_request)?;
        self.call_parsed(request, |message, diagnostics| WorkflowError::GenerationOracle {
            message,
            diagnostics,
        })
        .await
    }
}
