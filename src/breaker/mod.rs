//! Circuit breaker over three independent per-project ceilings.
//!
//! Counters live on the [`Project`] record ([`SafetyCounters`]) and are only
//! touched inside the state manager's locked read-modify-write, so the check
//! and the increment form one critical section across every worker.
//!
//! Tripping is sticky: a tripped ceiling denies every further action until an
//! operator calls [`CircuitBreaker::reset`]. Nothing in the engine resets a
//! ceiling on its own.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::LimitsSection;
use crate::errors::{PipelineError, Result};
use crate::notify::{self, NotificationSink};
use crate::stage::Stage;
use crate::state::{
    EscalationCause, Project, ProjectId, StageTransition, StateManager, TransitionEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    /// Lifetime agent invocations
    Invocations,
    /// Comment posts within a rolling hour
    CommentRate,
    /// Consecutive failures of a single stage
    ConsecutiveFailures,
}

impl Ceiling {
    pub const ALL: [Ceiling; 3] = [
        Ceiling::Invocations,
        Ceiling::CommentRate,
        Ceiling::ConsecutiveFailures,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invocations => "invocations",
            Self::CommentRate => "comment_rate",
            Self::ConsecutiveFailures => "consecutive_failures",
        }
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ceiling {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown ceiling '{}' (expected invocations, comment_rate or consecutive_failures)",
                    s
                )
            })
    }
}

/// Guarded action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Invoke,
    Comment,
}

/// Per-project breaker counters, persisted with the project state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyCounters {
    /// `agent_invocations` value the invocation ceiling counts from. Moved
    /// forward by an operator reset; the lifetime counter itself never resets.
    #[serde(default)]
    pub invocation_baseline: u64,
    /// Timestamps of allowed comment posts within the last hour.
    #[serde(default)]
    pub comment_log: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: BTreeMap<Stage, u32>,
    #[serde(default)]
    pub tripped: BTreeSet<Ceiling>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Result of evaluating one action against the ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Verdict {
    pub decision: Decision,
    /// Set when this evaluation is the one that tripped a ceiling.
    pub tripped: Option<Ceiling>,
}

fn comment_window() -> Duration {
    Duration::hours(1)
}

fn invocation_reason(limits: &LimitsSection) -> String {
    format!("Max agent invocations ({}) reached", limits.max_agent_invocations)
}

fn comment_reason(limits: &LimitsSection) -> String {
    format!("Max comments per hour ({}) reached", limits.max_comments_per_hour)
}

fn failure_reason(stage: Stage, limits: &LimitsSection) -> String {
    format!(
        "Stage '{}' failed {} consecutive times",
        stage, limits.max_consecutive_failures
    )
}

/// Check one action and, when allowed, count it.
///
/// Pure over the project record; the caller provides atomicity.
pub(crate) fn check_and_count(
    project: &mut Project,
    limits: &LimitsSection,
    action: ActionKind,
    now: DateTime<Utc>,
) -> Verdict {
    if project.is_escalated() {
        let reason = project
            .status_reason
            .clone()
            .unwrap_or_else(|| "project is escalated".to_string());
        return Verdict {
            decision: Decision::Denied { reason },
            tripped: None,
        };
    }

    let safety = &mut project.safety;
    match action {
        ActionKind::Invoke => {
            if safety.tripped.contains(&Ceiling::Invocations) {
                return denied(invocation_reason(limits), None);
            }
            let used = project.agent_invocations.saturating_sub(safety.invocation_baseline);
            if used >= limits.max_agent_invocations {
                safety.tripped.insert(Ceiling::Invocations);
                return denied(invocation_reason(limits), Some(Ceiling::Invocations));
            }
            project.agent_invocations += 1;
        }
        ActionKind::Comment => {
            let cutoff = now - comment_window();
            safety.comment_log.retain(|t| *t > cutoff);
            if safety.tripped.contains(&Ceiling::CommentRate) {
                return denied(comment_reason(limits), None);
            }
            if safety.comment_log.len() >= limits.max_comments_per_hour as usize {
                safety.tripped.insert(Ceiling::CommentRate);
                return denied(comment_reason(limits), Some(Ceiling::CommentRate));
            }
            safety.comment_log.push(now);
        }
    }
    Verdict {
        decision: Decision::Allowed,
        tripped: None,
    }
}

fn denied(reason: String, tripped: Option<Ceiling>) -> Verdict {
    Verdict {
        decision: Decision::Denied { reason },
        tripped,
    }
}

/// Count a failure of `stage`; returns the trip reason once the
/// consecutive-failure ceiling is reached.
pub(crate) fn record_failure(
    safety: &mut SafetyCounters,
    stage: Stage,
    limits: &LimitsSection,
) -> Option<String> {
    let count = safety.consecutive_failures.entry(stage).or_insert(0);
    *count += 1;
    if *count >= limits.max_consecutive_failures {
        safety.tripped.insert(Ceiling::ConsecutiveFailures);
        Some(failure_reason(stage, limits))
    } else {
        None
    }
}

/// Read-only view of the breaker for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub invocations_used: u64,
    pub invocation_limit: u64,
    pub lifetime_invocations: u64,
    pub comments_last_hour: usize,
    pub comment_limit: u32,
    pub consecutive_failures: BTreeMap<Stage, u32>,
    pub failure_limit: u32,
    pub tripped: Vec<Ceiling>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

impl BreakerStatus {
    pub fn from_project(project: &Project, limits: &LimitsSection, now: DateTime<Utc>) -> Self {
        let cutoff = now - comment_window();
        Self {
            invocations_used: project
                .agent_invocations
                .saturating_sub(project.safety.invocation_baseline),
            invocation_limit: limits.max_agent_invocations,
            lifetime_invocations: project.agent_invocations,
            comments_last_hour: project
                .safety
                .comment_log
                .iter()
                .filter(|t| **t > cutoff)
                .count(),
            comment_limit: limits.max_comments_per_hour,
            consecutive_failures: project.safety.consecutive_failures.clone(),
            failure_limit: limits.max_consecutive_failures,
            tripped: project.safety.tripped.iter().copied().collect(),
            escalation_reason: project.escalation.as_ref().map(|e| e.reason.clone()),
        }
    }

    pub fn is_tripped(&self) -> bool {
        !self.tripped.is_empty()
    }
}

/// Breaker handle bound to the state manager that persists its counters.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<StateManager>,
    notifier: Arc<dyn NotificationSink>,
}

impl CircuitBreaker {
    pub fn new(state: Arc<StateManager>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { state, notifier }
    }

    /// Check the action against its ceiling and count it in the same
    /// critical section.
    ///
    /// A denial escalates the project and posts an escalation notice the
    /// first time a ceiling trips; the caller must not perform the action.
    pub fn check_and_increment(&self, id: &ProjectId, action: ActionKind) -> Result<Decision> {
        let limits = self.state.config().limits.clone();
        let (verdict, stage) = self.state.mutate(id, |project, fx| {
            let now = fx.now();
            let verdict = check_and_count(project, &limits, action, now);
            match (&verdict.decision, verdict.tripped) {
                (Decision::Allowed, _) if action == ActionKind::Invoke => {
                    fx.log(
                        StageTransition::new(id, project.current_stage, TransitionEvent::AgentInvoked, now)
                            .with_details(serde_json::json!({
                                "agent_invocations": project.agent_invocations,
                            })),
                    );
                }
                (Decision::Denied { reason }, Some(ceiling)) => {
                    project.escalate(EscalationCause::Breaker { ceiling }, reason, now);
                    fx.log(
                        StageTransition::new(id, project.current_stage, TransitionEvent::Escalated, now)
                            .with_details(serde_json::json!({
                                "ceiling": ceiling,
                                "reason": reason,
                            })),
                    );
                }
                _ => {}
            }
            Ok((verdict, project.current_stage))
        })?;

        if let (Decision::Denied { reason }, Some(ceiling)) = (&verdict.decision, verdict.tripped) {
            tracing::warn!(project = %id, %ceiling, %stage, "circuit breaker tripped: {reason}");
            let details = format!("Ceiling '{}' tripped while at stage '{}'", ceiling, stage);
            notify::post_escalation(self.notifier.as_ref(), id, reason, &details);
        } else if let Decision::Denied { reason } = &verdict.decision {
            tracing::debug!(project = %id, ?action, "action denied: {reason}");
        }
        Ok(verdict.decision)
    }

    pub fn status(&self, id: &ProjectId) -> Result<BreakerStatus> {
        let project = self.state.get_state(id)?;
        Ok(BreakerStatus::from_project(
            &project,
            &self.state.config().limits,
            Utc::now(),
        ))
    }

    /// Operator reset of one ceiling.
    ///
    /// Resets the counter behind the ceiling (moving the invocation baseline
    /// rather than the lifetime count). When no ceiling remains tripped, a
    /// breaker escalation is cleared and the interrupted status restored.
    pub fn reset(&self, id: &ProjectId, ceiling: Ceiling) -> Result<Project> {
        let project = self.state.mutate(id, |project, fx| {
            let now = fx.now();
            let was_tripped = project.safety.tripped.remove(&ceiling);
            match ceiling {
                Ceiling::Invocations => {
                    project.safety.invocation_baseline = project.agent_invocations;
                }
                Ceiling::CommentRate => project.safety.comment_log.clear(),
                Ceiling::ConsecutiveFailures => project.safety.consecutive_failures.clear(),
            }
            fx.log(
                StageTransition::new(id, project.current_stage, TransitionEvent::BreakerReset, now)
                    .with_details(serde_json::json!({
                        "ceiling": ceiling,
                        "was_tripped": was_tripped,
                    })),
            );

            let breaker_escalation = matches!(
                project.escalation.as_ref().map(|e| &e.cause),
                Some(EscalationCause::Breaker { .. })
            );
            if breaker_escalation && project.safety.tripped.is_empty() {
                if let Some(resolved) = project.clear_escalation() {
                    fx.log(
                        StageTransition::new(
                            id,
                            project.current_stage,
                            TransitionEvent::EscalationResolved,
                            now,
                        )
                        .with_details(serde_json::json!({ "reason": resolved.reason })),
                    );
                }
            }
            Ok(project.clone())
        })?;
        tracing::info!(project = %id, %ceiling, status = %project.status, "circuit breaker reset");
        Ok(project)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker").finish_non_exhaustive()
    }
}

/// Parse a ceiling name, for CLI input.
pub fn parse_ceiling(raw: &str) -> Result<Ceiling> {
    raw.parse::<Ceiling>().map_err(PipelineError::Config)
}
