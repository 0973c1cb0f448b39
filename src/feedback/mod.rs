//! Bounded refinement loop between two adjacent stages.
//!
//! After the validate stage (default `plan`) runs, its [`SimulationReport`]
//! decides the loop:
//!
//! | Report                                   | Decision                         |
//! |------------------------------------------|----------------------------------|
//! | verdict `blocked`                        | escalate immediately             |
//! | no findings                              | converged, pipeline moves on     |
//! | findings, `iterations < max_iterations`  | re-enter the refine stage        |
//! | findings, `iterations >= max_iterations` | escalate                         |
//!
//! Structural task-graph problems ([`graph`]) count as findings; estimate
//! outliers are carried as advisories and never block.

pub mod graph;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::{PipelineError, Result};
use crate::notify::{self, NotificationSink};
use crate::stage::Stage;
use crate::state::{
    EscalationCause, Project, ProjectId, ProjectStatus, StageTransition, StateManager,
    TransitionEvent,
};
use graph::{GraphReport, TaskGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationVerdict {
    Ready,
    NeedsRevision,
    Blocked,
}

/// Output of the validate stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub verdict: SimulationVerdict,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_graph: Option<TaskGraph>,
}

impl SimulationReport {
    pub fn ready() -> Self {
        Self {
            verdict: SimulationVerdict::Ready,
            findings: Vec::new(),
            task_graph: None,
        }
    }

    pub fn needs_revision(findings: Vec<String>) -> Self {
        Self {
            verdict: SimulationVerdict::NeedsRevision,
            findings,
            task_graph: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Active,
    Converged,
    Escalated,
}

/// Loop bookkeeping, persisted on the project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackLoopState {
    pub refine_stage: Stage,
    pub validate_stage: Stage,
    /// Revisions performed so far.
    pub iteration_count: u32,
    pub max_iterations: u32,
    /// Findings from the most recent evaluation.
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub advisories: Vec<String>,
    pub status: LoopStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FeedbackLoopState {
    pub fn new(refine_stage: Stage, validate_stage: Stage, max_iterations: u32, now: DateTime<Utc>) -> Self {
        Self {
            refine_stage,
            validate_stage,
            iteration_count: 0,
            max_iterations,
            findings: Vec::new(),
            advisories: Vec::new(),
            status: LoopStatus::Active,
            started_at: now,
            ended_at: None,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_iterations.saturating_sub(self.iteration_count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackDecision {
    Converged { iterations: u32, advisories: Vec<String> },
    Revise { iteration: u32, findings: Vec<String> },
    Escalated { iterations: u32, reason: String },
}

impl fmt::Display for FeedbackDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged { iterations, .. } => write!(f, "converged after {} revision(s)", iterations),
            Self::Revise { iteration, findings } => {
                write!(f, "revision {} requested ({} finding(s))", iteration, findings.len())
            }
            Self::Escalated { reason, .. } => write!(f, "escalated: {}", reason),
        }
    }
}

/// Advance the loop by one evaluation. Pure over the loop state.
pub fn decide(
    state: &mut FeedbackLoopState,
    verdict: SimulationVerdict,
    findings: &[String],
) -> FeedbackDecision {
    if verdict == SimulationVerdict::Blocked {
        let detail = if findings.is_empty() {
            "no details reported".to_string()
        } else {
            findings.join("; ")
        };
        return FeedbackDecision::Escalated {
            iterations: state.iteration_count,
            reason: format!("Validation blocked: {}", detail),
        };
    }
    if findings.is_empty() {
        return FeedbackDecision::Converged {
            iterations: state.iteration_count,
            advisories: state.advisories.clone(),
        };
    }
    if state.iteration_count < state.max_iterations {
        state.iteration_count += 1;
        return FeedbackDecision::Revise {
            iteration: state.iteration_count,
            findings: findings.to_vec(),
        };
    }
    FeedbackDecision::Escalated {
        iterations: state.iteration_count,
        reason: format!(
            "Feedback loop did not converge after {} iterations: {} finding(s) remain",
            state.iteration_count,
            findings.len()
        ),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub active: bool,
    pub refine_stage: Stage,
    pub validate_stage: Stage,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub remaining: u32,
    pub findings: Vec<String>,
    pub archived_loops: usize,
}

/// Drives the loop for a project through the state manager.
#[derive(Clone)]
pub struct FeedbackLoopController {
    state: Arc<StateManager>,
    notifier: Arc<dyn NotificationSink>,
}

impl FeedbackLoopController {
    pub fn new(state: Arc<StateManager>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { state, notifier }
    }

    /// Apply the validate stage's report.
    ///
    /// Must run while the validate stage is in progress. On `Revise` the
    /// project moves back to the refine stage (the one sanctioned backwards
    /// move) with the findings recorded for the next attempt; on
    /// `Converged` the caller completes the validate stage as usual.
    pub fn evaluate(&self, id: &ProjectId, report: &SimulationReport) -> Result<FeedbackDecision> {
        let config = self.state.config();
        let (refine, validate) = config.feedback_pair();
        let max_iterations = config.feedback.max_iterations;
        let graph_report = report
            .task_graph
            .as_ref()
            .map(|g| GraphReport::analyze(g, &config.feedback.estimates));

        let decision = self.state.mutate(id, |project, fx| {
            if let Some(err) = project.escalation_error() {
                return Err(err);
            }
            if !project.is_running(validate) {
                return Err(PipelineError::invalid_transition(
                    id,
                    format!(
                        "feedback is evaluated while '{}' is running (current stage '{}', status {})",
                        validate, project.current_stage, project.status
                    ),
                ));
            }
            let now = fx.now();

            let mut findings = report.findings.clone();
            let mut advisories = Vec::new();
            if let Some(graph_report) = &graph_report {
                findings.extend(graph_report.blocking_findings());
                advisories = graph_report.advisories();
            }
            if report.verdict == SimulationVerdict::NeedsRevision && findings.is_empty() {
                findings.push("validator requested a revision without findings".to_string());
            }

            let loop_state = project
                .feedback_loop
                .get_or_insert_with(|| FeedbackLoopState::new(refine, validate, max_iterations, now));
            loop_state.findings = findings.clone();
            loop_state.advisories = advisories;
            let decision = decide(loop_state, report.verdict, &findings);

            match &decision {
                FeedbackDecision::Converged { iterations, .. } => {
                    archive(project, LoopStatus::Converged, now);
                    tracing::info!(project = %id, iterations, "feedback loop converged");
                }
                FeedbackDecision::Revise { iteration, findings } => {
                    project.stop_running(validate);
                    project.current_stage = refine;
                    project.status = ProjectStatus::InProgress;
                    project.recovery_info.resume_from_stage = Some(refine);
                    fx.log(
                        StageTransition::new(id, validate, TransitionEvent::FeedbackRevision, now)
                            .with_details(serde_json::json!({
                                "iteration": iteration,
                                "max_iterations": max_iterations,
                                "findings": findings,
                                "return_to": refine,
                            })),
                    );
                    fx.checkpoint(project, validate)?;
                    tracing::info!(
                        project = %id,
                        iteration,
                        max_iterations,
                        findings = findings.len(),
                        "feedback revision: returning to {refine}"
                    );
                }
                FeedbackDecision::Escalated { iterations, reason } => {
                    project.stop_running(validate);
                    project.escalate(EscalationCause::FeedbackLoop { iterations: *iterations }, reason, now);
                    archive(project, LoopStatus::Escalated, now);
                    fx.log(
                        StageTransition::new(id, validate, TransitionEvent::Escalated, now)
                            .with_details(serde_json::json!({
                                "iterations": iterations,
                                "reason": reason,
                            })),
                    );
                    tracing::warn!(project = %id, iterations, "feedback loop escalated: {reason}");
                }
            }
            Ok(decision)
        })?;

        if let FeedbackDecision::Escalated { iterations, reason } = &decision {
            let details = format!(
                "'{}' and '{}' did not converge; {} revision(s) attempted",
                refine, validate, iterations
            );
            notify::post_escalation(self.notifier.as_ref(), id, reason, &details);
        }
        Ok(decision)
    }

    pub fn stats(&self, id: &ProjectId) -> Result<FeedbackStats> {
        let project = self.state.get_state(id)?;
        let config = self.state.config();
        let (refine, validate) = config.feedback_pair();
        let max_iterations = config.feedback.max_iterations;
        Ok(match &project.feedback_loop {
            Some(active) => FeedbackStats {
                active: true,
                refine_stage: active.refine_stage,
                validate_stage: active.validate_stage,
                iterations_used: active.iteration_count,
                max_iterations: active.max_iterations,
                remaining: active.remaining(),
                findings: active.findings.clone(),
                archived_loops: project.feedback_history.len(),
            },
            None => FeedbackStats {
                active: false,
                refine_stage: refine,
                validate_stage: validate,
                iterations_used: 0,
                max_iterations,
                remaining: max_iterations,
                findings: Vec::new(),
                archived_loops: project.feedback_history.len(),
            },
        })
    }

    /// Operator resolution of a feedback-loop escalation. The validate stage
    /// runs again with a fresh loop.
    pub fn resolve(&self, id: &ProjectId) -> Result<Project> {
        let project = self.state.mutate(id, |project, fx| {
            let is_feedback = matches!(
                project.escalation.as_ref().map(|e| &e.cause),
                Some(EscalationCause::FeedbackLoop { .. })
            );
            if !is_feedback {
                return Err(PipelineError::invalid_transition(
                    id,
                    "project has no feedback-loop escalation to resolve",
                ));
            }
            if let Some(resolved) = project.clear_escalation() {
                fx.log(
                    StageTransition::new(id, project.current_stage, TransitionEvent::EscalationResolved, fx.now())
                        .with_details(serde_json::json!({ "reason": resolved.reason })),
                );
            }
            Ok(project.clone())
        })?;
        tracing::info!(project = %id, status = %project.status, "feedback escalation resolved");
        Ok(project)
    }
}

impl fmt::Debug for FeedbackLoopController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackLoopController").finish_non_exhaustive()
    }
}

fn archive(project: &mut Project, status: LoopStatus, now: DateTime<Utc>) {
    if let Some(mut finished) = project.feedback_loop.take() {
        finished.status = status;
        finished.ended_at = Some(now);
        project.feedback_history.push(finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(max: u32) -> FeedbackLoopState {
        FeedbackLoopState::new(Stage::Specify, Stage::Plan, max, Utc::now())
    }

    #[test]
    fn empty_findings_converge_immediately() {
        let mut state = fresh(3);
        assert_eq!(
            decide(&mut state, SimulationVerdict::Ready, &[]),
            FeedbackDecision::Converged {
                iterations: 0,
                advisories: Vec::new()
            }
        );
    }

    #[test]
    fn non_converging_loop_escalates_after_exactly_max_revisions() {
        for max in 1..=5 {
            let mut state = fresh(max);
            let findings = vec!["gap in acceptance criteria".to_string()];
            let mut revisions = 0;
            let decision = loop {
                match decide(&mut state, SimulationVerdict::NeedsRevision, &findings) {
                    FeedbackDecision::Revise { iteration, .. } => {
                        revisions += 1;
                        assert_eq!(iteration, revisions);
                    }
                    other => break other,
                }
                assert!(revisions <= max, "loop ran past its ceiling");
            };
            assert_eq!(revisions, max);
            assert!(matches!(
                decision,
                FeedbackDecision::Escalated { iterations, .. } if iterations == max
            ));
        }
    }

    #[test]
    fn blocked_escalates_regardless_of_iterations() {
        let mut state = fresh(3);
        let decision = decide(
            &mut state,
            SimulationVerdict::Blocked,
            &["needs legal review".to_string()],
        );
        match decision {
            FeedbackDecision::Escalated { iterations, reason } => {
                assert_eq!(iterations, 0);
                assert!(reason.contains("needs legal review"));
            }
            other => panic!("Expected Escalated, got {other:?}"),
        }
    }

    #[test]
    fn convergence_after_revisions_reports_count() {
        let mut state = fresh(3);
        decide(&mut state, SimulationVerdict::NeedsRevision, &["x".to_string()]);
        let decision = decide(&mut state, SimulationVerdict::Ready, &[]);
        assert!(matches!(
            decision,
            FeedbackDecision::Converged { iterations: 1, .. }
        ));
        assert_eq!(state.remaining(), 2);
    }

    #[test]
    fn report_parses_with_optional_graph() {
        let report: SimulationReport = serde_json::from_str(
            r#"{"verdict":"needs_revision","findings":["a"],"task_graph":{"tasks":[{"id":"t1"}]}}"#,
        )
        .unwrap();
        assert_eq!(report.verdict, SimulationVerdict::NeedsRevision);
        assert_eq!(report.task_graph.unwrap().tasks[0].id, "t1");
        let ready: SimulationReport = serde_json::from_str(r#"{"verdict":"ready"}"#).unwrap();
        assert_eq!(ready, SimulationReport::ready());
    }
}
