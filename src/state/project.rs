//! The Project record: everything persisted in a project's `state.json`.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::breaker::{Ceiling, SafetyCounters};
use crate::errors::{PipelineError, Result};
use crate::feedback::FeedbackLoopState;
use crate::stage::Stage;

/// `project-<positive integer>`: no sign, no leading zeros, ASCII digits only.
static PROJECT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^project-[1-9][0-9]{0,17}$").unwrap());

/// Validated project identifier.
///
/// Project ids name storage directories, so construction is the
/// injection-prevention boundary: a `ProjectId` can never contain a path
/// separator, a dot segment or anything but the fixed pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn parse(raw: &str) -> Result<Self> {
        if PROJECT_ID_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(PipelineError::InvalidProjectId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric part of the id.
    pub fn number(&self) -> u64 {
        self.0["project-".len()..].parse().unwrap_or(0)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// Stage to dispatch next when resuming; `None` once the pipeline is done.
    pub resume_from_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
}

/// Timing and attempt bookkeeping for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Set by a start, cleared once the attempt completes, fails or is abandoned.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationCause {
    Breaker { ceiling: Ceiling },
    FeedbackLoop { iterations: u32 },
}

/// Why and when autonomous processing stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub cause: EscalationCause,
    pub reason: String,
    pub stage: Stage,
    pub at: DateTime<Utc>,
    /// Status to restore once the escalation is resolved.
    pub status_before: ProjectStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub current_stage: Stage,
    /// Append-only; a feedback-controlled stage appears once per pass.
    pub stages_completed: Vec<Stage>,
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Lifetime count, never reset.
    pub agent_invocations: u64,
    pub errors: Vec<ErrorEntry>,
    pub recovery_info: RecoveryInfo,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageRecord>,
    #[serde(default)]
    pub safety: SafetyCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_loop: Option<FeedbackLoopState>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackLoopState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    #[serde(default)]
    pub checkpoint_seq: u64,
    #[serde(default)]
    pub dead_letter_seq: u64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Project {
    pub fn new(id: ProjectId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_updated: now,
            current_stage: Stage::first(),
            stages_completed: Vec::new(),
            status: ProjectStatus::Pending,
            status_reason: None,
            agent_invocations: 0,
            errors: Vec::new(),
            recovery_info: RecoveryInfo {
                resume_from_stage: Some(Stage::first()),
                last_checkpoint: None,
            },
            stages: BTreeMap::new(),
            safety: SafetyCounters::default(),
            feedback_loop: None,
            feedback_history: Vec::new(),
            escalation: None,
            checkpoint_seq: 0,
            dead_letter_seq: 0,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ProjectStatus::Completed
    }

    pub fn is_escalated(&self) -> bool {
        self.status == ProjectStatus::Escalated
    }

    /// Whether `stage` is the current stage and has an attempt in flight.
    pub fn is_running(&self, stage: Stage) -> bool {
        self.status == ProjectStatus::InProgress
            && self.current_stage == stage
            && self.stages.get(&stage).is_some_and(|r| r.running)
    }

    /// Clear the in-flight marker of `stage`, if any.
    pub(crate) fn stop_running(&mut self, stage: Stage) {
        if let Some(record) = self.stages.get_mut(&stage) {
            record.running = false;
        }
    }

    /// Whether `stage` finished at least once and is not queued to run again.
    pub fn has_completed(&self, stage: Stage) -> bool {
        self.stages_completed.contains(&stage) && (self.current_stage != stage || self.is_completed())
    }

    /// Mark the project escalated. The first escalation's cause is kept when
    /// a second ceiling trips on an already escalated project.
    pub(crate) fn escalate(&mut self, cause: EscalationCause, reason: &str, now: DateTime<Utc>) {
        if self.escalation.is_none() {
            self.escalation = Some(Escalation {
                cause,
                reason: reason.to_string(),
                stage: self.current_stage,
                at: now,
                status_before: self.status,
            });
        }
        self.status = ProjectStatus::Escalated;
        self.status_reason = Some(reason.to_string());
    }

    /// Clear the escalation and restore the status it interrupted.
    pub(crate) fn clear_escalation(&mut self) -> Option<Escalation> {
        let escalation = self.escalation.take()?;
        self.stop_running(self.current_stage);
        self.status = match escalation.status_before {
            // A stage that was running when autonomy stopped has to be restarted.
            ProjectStatus::InProgress | ProjectStatus::Escalated => ProjectStatus::Pending,
            other => other,
        };
        self.status_reason = None;
        Some(escalation)
    }

    /// Reject operations on a project that is escalated, finished or failed.
    pub fn ensure_active(&self) -> Result<()> {
        if let Some(err) = self.escalation_error() {
            return Err(err);
        }
        match self.status {
            ProjectStatus::Completed => Err(PipelineError::invalid_transition(
                &self.id,
                "pipeline already completed",
            )),
            ProjectStatus::Failed => Err(PipelineError::invalid_transition(
                &self.id,
                format!(
                    "project failed ({}); recover before restarting",
                    self.status_reason.as_deref().unwrap_or("no reason recorded")
                ),
            )),
            _ => Ok(()),
        }
    }

    /// The error an operation on this project must fail with while escalated.
    pub fn escalation_error(&self) -> Option<PipelineError> {
        if !self.is_escalated() {
            return None;
        }
        let reason = self
            .status_reason
            .clone()
            .unwrap_or_else(|| "escalated".to_string());
        Some(match self.escalation.as_ref().map(|e| &e.cause) {
            Some(EscalationCause::FeedbackLoop { iterations }) => {
                PipelineError::FeedbackLoopEscalated {
                    project: self.id.to_string(),
                    iterations: *iterations,
                    reason,
                }
            }
            _ => PipelineError::CircuitBreakerTripped {
                project: self.id.to_string(),
                reason,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_accepts_only_the_strict_pattern() {
        for ok in ["project-1", "project-42", "project-900000000000000000"] {
            assert!(ProjectId::parse(ok).is_ok(), "{ok} should parse");
        }
        for bad in [
            "../../etc",
            "project-0",
            "project-007",
            "project--1",
            "project-1/../2",
            "project-1 ",
            "Project-1",
            "project-",
            "project-١",
            "project-1\n",
            "project-1234567890123456789",
        ] {
            assert!(
                matches!(ProjectId::parse(bad), Err(PipelineError::InvalidProjectId(_))),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(ProjectId::parse("project-42").unwrap().number(), 42);
    }

    #[test]
    fn project_id_validates_on_deserialize() {
        let id: ProjectId = serde_json::from_str("\"project-3\"").unwrap();
        assert_eq!(id.as_str(), "project-3");
        assert!(serde_json::from_str::<ProjectId>("\"../project-3\"").is_err());
    }

    #[test]
    fn new_project_starts_pending_at_first_stage() {
        let project = Project::new(ProjectId::parse("project-1").unwrap(), Utc::now());
        assert_eq!(project.status, ProjectStatus::Pending);
        assert_eq!(project.current_stage, Stage::Intake);
        assert_eq!(project.recovery_info.resume_from_stage, Some(Stage::Intake));
        assert!(project.stages_completed.is_empty());
        assert!(project.escalation_error().is_none());
    }

    #[test]
    fn state_round_trips_through_json_with_stage_keys() {
        let mut project = Project::new(ProjectId::parse("project-5").unwrap(), Utc::now());
        project.stages.insert(
            Stage::Intake,
            StageRecord {
                attempts: 2,
                agent: Some("triage".into()),
                ..Default::default()
            },
        );
        project.safety.consecutive_failures.insert(Stage::Verify, 1);
        let json = serde_json::to_string(&project).unwrap();
        assert!(json.contains("\"intake\""));
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back, project);
    }

    #[test]
    fn first_escalation_cause_wins_and_clear_restores_status() {
        let mut project = Project::new(ProjectId::parse("project-8").unwrap(), Utc::now());
        project.status = ProjectStatus::InProgress;
        project.escalate(
            EscalationCause::Breaker {
                ceiling: Ceiling::Invocations,
            },
            "Max agent invocations (20) reached",
            Utc::now(),
        );
        project.escalate(
            EscalationCause::FeedbackLoop { iterations: 3 },
            "did not converge",
            Utc::now(),
        );
        let escalation = project.escalation.clone().unwrap();
        assert_eq!(
            escalation.cause,
            EscalationCause::Breaker {
                ceiling: Ceiling::Invocations
            }
        );
        assert!(matches!(
            project.escalation_error(),
            Some(PipelineError::CircuitBreakerTripped { .. })
        ));

        project.clear_escalation();
        assert_eq!(project.status, ProjectStatus::Pending);
        assert!(project.status_reason.is_none());
    }
}
