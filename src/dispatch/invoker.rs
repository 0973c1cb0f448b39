//! The agent invocation seam.
//!
//! The engine treats agents as opaque blocking calls: one request in, one
//! outcome out, no retries inside the invoker. Retrying is the dispatcher's
//! and circuit breaker's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::InvokerSection;
use crate::feedback::SimulationReport;
use crate::stage::Stage;
use crate::state::ProjectId;

/// Everything an agent receives for one stage attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub project_id: ProjectId,
    pub stage: Stage,
    pub agent: String,
    pub task_description: String,
    pub context_files: Vec<PathBuf>,
    /// Findings from the last validation, when the stage is being revised.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    pub attempt: u32,
}

/// Model usage reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub artifact: String,
    pub success: bool,
    pub error: Option<String>,
    /// Whether a failed attempt may succeed if repeated.
    pub retryable: bool,
    pub usage: Option<ModelUsage>,
    /// Structured validation output, for the validate stage.
    pub report: Option<SimulationReport>,
    pub duration: Duration,
}

impl AgentOutcome {
    pub fn success(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            success: true,
            error: None,
            retryable: false,
            usage: None,
            report: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            artifact: String::new(),
            success: false,
            error: Some(error.into()),
            retryable,
            usage: None,
            report: None,
            duration: Duration::ZERO,
        }
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_report(mut self, report: SimulationReport) -> Self {
        self.report = Some(report);
        self
    }
}

/// Performs the work of a stage.
///
/// Real implementation: [`CommandInvoker`]. Infrastructure problems (spawn
/// failure, timeout) are reported as unsuccessful outcomes, not errors.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> AgentOutcome;
}

/// Structured stdout an agent command may print instead of a bare artifact.
#[derive(Debug, Deserialize)]
struct Envelope {
    artifact: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
    #[serde(default)]
    usage: Option<ModelUsage>,
    #[serde(default)]
    report: Option<SimulationReport>,
}

/// Runs an external command per stage attempt.
///
/// The request is written to stdin as JSON and stdout becomes the artifact.
/// Stdout may instead be an envelope object
/// `{"artifact": ..., "usage": {...}, "report": {...}}`. A zero exit status
/// is success; a non-zero exit is a retryable failure carrying stderr.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    command: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandInvoker {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `None` when no command is configured.
    pub fn from_config(section: &InvokerSection) -> Option<Self> {
        let command = section.command.as_ref()?;
        let mut invoker = Self::new(command.clone(), section.args.clone());
        if let Some(secs) = section.timeout_secs {
            invoker = invoker.with_timeout(Duration::from_secs(secs));
        }
        Some(invoker)
    }

    async fn run(&self, request: &AgentRequest) -> AgentOutcome {
        let payload = match serde_json::to_vec(request) {
            Ok(payload) => payload,
            Err(e) => return AgentOutcome::failure(format!("failed to encode request: {}", e), false),
        };

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("STAGEWARDEN_PROJECT", request.project_id.as_str())
            .env("STAGEWARDEN_STAGE", request.stage.as_str())
            .env("STAGEWARDEN_AGENT", &request.agent)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AgentOutcome::failure(
                    format!("failed to spawn agent command '{}': {}", self.command, e),
                    false,
                );
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(command = %self.command, "agent did not read request: {e}");
            }
            drop(stdin);
        }

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    return AgentOutcome::failure(
                        format!("agent command timed out after {}s", limit.as_secs()),
                        true,
                    );
                }
            },
            None => child.wait_with_output().await,
        };
        let output = match waited {
            Ok(output) => output,
            Err(e) => return AgentOutcome::failure(format!("failed to wait for agent command: {}", e), true),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let error = if stderr.is_empty() {
                format!("agent command exited with {}", output.status)
            } else {
                stderr
            };
            return AgentOutcome::failure(error, true);
        }
        parse_stdout(stdout)
    }
}

fn parse_stdout(stdout: String) -> AgentOutcome {
    if stdout.trim_start().starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(&stdout) {
            let success = envelope.success.unwrap_or(true);
            return AgentOutcome {
                artifact: envelope.artifact,
                success,
                error: if success {
                    None
                } else {
                    Some(envelope.error.unwrap_or_else(|| "agent reported failure".to_string()))
                },
                retryable: envelope.retryable.unwrap_or(!success),
                usage: envelope.usage,
                report: envelope.report,
                duration: Duration::ZERO,
            };
        }
    }
    AgentOutcome::success(stdout)
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    async fn invoke(&self, request: &AgentRequest) -> AgentOutcome {
        let started = Instant::now();
        tracing::debug!(
            command = %self.command,
            project = %request.project_id,
            stage = %request.stage,
            agent = %request.agent,
            "spawning agent command"
        );
        let mut outcome = self.run(request).await;
        outcome.duration = started.elapsed();
        outcome
    }
}
