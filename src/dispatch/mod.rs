//! Dispatcher: the coordination layer between callers, agents and the state
//! manager.
//!
//! A dispatch validates its input first and fails closed: the project id must
//! parse and every derived path must stay under the project-data root. Only
//! then does it consult the breaker, start the stage, invoke the agent
//! (outside any lock) and report the outcome back. It holds no persistent
//! state of its own; re-dispatching a stage that already completed is a
//! no-op.

mod invoker;
mod paths;

pub use invoker::{AgentInvoker, AgentOutcome, AgentRequest, CommandInvoker, ModelUsage};
pub use paths::PathGuard;

use chrono::Utc;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::breaker::{ActionKind, CircuitBreaker, Decision};
use crate::errors::{PipelineError, Result};
use crate::feedback::{FeedbackDecision, FeedbackLoopController, SimulationReport};
use crate::notify::{self, NotificationSink};
use crate::stage::Stage;
use crate::state::{
    ARTIFACT_DIR, FailureOutcome, Project, ProjectId, ProjectStatus, StageFailure, StateManager,
};
use crate::store;
use crate::usage::{UNREPORTED_MODEL, UsageRecord, UsageTracker};

/// A request to advance one project by one stage.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    /// Raw, unvalidated project id.
    pub project_id: String,
    /// Stage to run; the project's current stage when `None`.
    pub stage: Option<Stage>,
    /// Extra input files handed to the agent. Must live under the root.
    pub context_files: Vec<PathBuf>,
}

impl DispatchRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_context_files(mut self, files: Vec<PathBuf>) -> Self {
        self.context_files = files;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The stage had already completed; nothing ran.
    AlreadyCompleted { stage: Stage },
    /// The stage completed. `next` is `None` when the pipeline finished.
    Completed {
        stage: Stage,
        next: Option<Stage>,
        artifact: PathBuf,
    },
    /// The validate stage sent the project back to the refine stage.
    Revised { iteration: u32 },
    /// The attempt failed and may be retried.
    RetryPermitted { stage: Stage, remaining: u32 },
    /// The attempt failed permanently; the project is `failed`.
    Failed { stage: Stage, reason: String },
    /// A ceiling or the feedback loop escalated the project.
    Escalated { reason: String },
}

impl DispatchOutcome {
    /// Whether autonomous processing has to stop after this outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Escalated { .. } | Self::Completed { next: None, .. }
        )
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyCompleted { stage } => write!(f, "{} already completed", stage),
            Self::Completed {
                stage,
                next: Some(next),
                ..
            } => write!(f, "{} completed, next: {}", stage, next),
            Self::Completed { stage, next: None, .. } => {
                write!(f, "{} completed, pipeline finished", stage)
            }
            Self::Revised { iteration } => write!(f, "feedback revision {}", iteration),
            Self::RetryPermitted { stage, remaining } => {
                write!(f, "{} failed, {} retries remaining", stage, remaining)
            }
            Self::Failed { stage, reason } => write!(f, "{} failed: {}", stage, reason),
            Self::Escalated { reason } => write!(f, "escalated: {}", reason),
        }
    }
}

/// Result of [`Dispatcher::run_to_completion`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub project: Project,
    pub dispatches: Vec<DispatchOutcome>,
}

pub struct Dispatcher {
    state: Arc<StateManager>,
    breaker: CircuitBreaker,
    feedback: FeedbackLoopController,
    usage: UsageTracker,
    invoker: Arc<dyn AgentInvoker>,
    notifier: Arc<dyn NotificationSink>,
    guard: PathGuard,
}

impl Dispatcher {
    pub fn new(
        state: Arc<StateManager>,
        invoker: Arc<dyn AgentInvoker>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let guard = PathGuard::new(state.root())?;
        Ok(Self {
            breaker: CircuitBreaker::new(state.clone(), notifier.clone()),
            feedback: FeedbackLoopController::new(state.clone(), notifier.clone()),
            usage: UsageTracker::new(state.clone()),
            state,
            invoker,
            notifier,
            guard,
        })
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn feedback(&self) -> &FeedbackLoopController {
        &self.feedback
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Run one stage of one project.
    ///
    /// Caller errors (bad id, path escape, wrong stage) are returned before
    /// anything is written. Agent failures are reported through the state
    /// manager and come back as an outcome, not an error.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        let id = ProjectId::parse(&request.project_id)?;
        self.guard.resolve(Path::new(id.as_str()))?;
        let context_files = request
            .context_files
            .iter()
            .map(|file| self.guard_context_file(file))
            .collect::<Result<Vec<_>>>()?;

        let project = self.state.get_state(&id)?;
        let stage = request.stage.unwrap_or(project.current_stage);
        let assignment = self.state.config().assignment(stage);
        let artifact_path = self.guard.resolve(
            &Path::new(id.as_str())
                .join(ARTIFACT_DIR)
                .join(&assignment.output),
        )?;

        if project.is_completed() || project.has_completed(stage) {
            tracing::info!(project = %id, %stage, "stage already completed, nothing to dispatch");
            return Ok(DispatchOutcome::AlreadyCompleted { stage });
        }
        project.ensure_active()?;
        if stage != project.current_stage {
            return Err(PipelineError::unexpected_stage(&id, project.current_stage, stage));
        }

        if let Decision::Denied { reason } = self.breaker.check_and_increment(&id, ActionKind::Invoke)? {
            return Ok(DispatchOutcome::Escalated { reason });
        }

        let started = self.state.start_stage(&id, stage, &assignment.agent)?;
        let attempt = started.stages.get(&stage).map(|r| r.attempts).unwrap_or(1);
        let (refine, validate) = self.state.config().feedback_pair();
        let findings = match &started.feedback_loop {
            Some(active) if stage == refine => active.findings.clone(),
            _ => Vec::new(),
        };

        let agent_request = AgentRequest {
            project_id: id.clone(),
            stage,
            agent: assignment.agent.clone(),
            task_description: assignment.description.clone(),
            context_files,
            findings,
            attempt,
        };
        tracing::info!(project = %id, %stage, agent = %assignment.agent, attempt, "invoking agent");
        let outcome = self.invoker.invoke(&agent_request).await;
        self.record_usage(&id, &agent_request, &outcome);

        if !outcome.success {
            let message = outcome
                .error
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            let failure = if outcome.retryable {
                StageFailure::retryable(message)
            } else {
                StageFailure::fatal(message)
            };
            return self.report_failure(&id, stage, &assignment.agent, failure, &agent_request);
        }

        store::write_atomic_with(&artifact_path, |file| file.write_all(outcome.artifact.as_bytes()))?;
        tracing::debug!(project = %id, %stage, path = %artifact_path.display(), "artifact written");

        if stage == validate {
            let Some(report) = simulation_report(&outcome) else {
                let failure = StageFailure::fatal(format!(
                    "'{}' produced no simulation report (expected a JSON object with a verdict)",
                    stage
                ));
                return self.report_failure(&id, stage, &assignment.agent, failure, &agent_request);
            };
            match self.feedback.evaluate(&id, &report)? {
                FeedbackDecision::Converged { .. } => {}
                FeedbackDecision::Revise { iteration, .. } => {
                    return Ok(DispatchOutcome::Revised { iteration });
                }
                FeedbackDecision::Escalated { reason, .. } => {
                    return Ok(DispatchOutcome::Escalated { reason });
                }
            }
        }

        let project = self.state.complete_stage_with_artifacts(
            &id,
            stage,
            &assignment.agent,
            std::slice::from_ref(&assignment.output),
        )?;
        let next = if project.is_completed() {
            None
        } else {
            Some(project.current_stage)
        };
        Ok(DispatchOutcome::Completed {
            stage,
            next,
            artifact: artifact_path,
        })
    }

    /// Autonomous mode: recover, then dispatch from the resume stage until
    /// the pipeline completes, fails or escalates. A project that does not
    /// exist yet is initialized first.
    ///
    /// The breaker's invocation ceiling bounds the loop.
    pub async fn run_to_completion(&self, raw_id: &str) -> Result<RunSummary> {
        let id = ProjectId::parse(raw_id)?;
        let mut project = match self.state.recover(&id) {
            Ok(project) => project,
            Err(PipelineError::NotFound(_)) => self.state.initialize_project(id.as_str())?,
            Err(err) => return Err(err),
        };

        let mut dispatches = Vec::new();
        while !project.is_completed()
            && !project.is_escalated()
            && project.status != ProjectStatus::Failed
        {
            let outcome = self.dispatch(&DispatchRequest::new(id.as_str())).await?;
            tracing::info!(project = %id, "{outcome}");
            let stop = outcome.is_terminal() || matches!(outcome, DispatchOutcome::AlreadyCompleted { .. });
            dispatches.push(outcome);
            project = self.state.get_state(&id)?;
            if stop {
                break;
            }
        }
        tracing::info!(
            project = %id,
            status = %project.status,
            dispatches = dispatches.len(),
            "autonomous run finished"
        );
        Ok(RunSummary { project, dispatches })
    }

    fn guard_context_file(&self, file: &Path) -> Result<PathBuf> {
        if file.is_absolute() {
            self.guard.check(file)
        } else {
            self.guard.resolve(file)
        }
    }

    fn report_failure(
        &self,
        id: &ProjectId,
        stage: Stage,
        agent: &str,
        failure: StageFailure,
        request: &AgentRequest,
    ) -> Result<DispatchOutcome> {
        let failure = failure.with_context(serde_json::json!({
            "task_description": request.task_description,
            "context_files": request.context_files,
            "findings": request.findings,
        }));
        Ok(match self.state.fail_stage(id, stage, agent, failure)? {
            FailureOutcome::RetryPermitted { remaining, .. } => {
                DispatchOutcome::RetryPermitted { stage, remaining }
            }
            FailureOutcome::Failed { reason } => DispatchOutcome::Failed { stage, reason },
            FailureOutcome::Escalated { reason } => {
                let details = format!("Stage '{}' (agent '{}') kept failing", stage, agent);
                notify::post_escalation(self.notifier.as_ref(), id, &reason, &details);
                DispatchOutcome::Escalated { reason }
            }
        })
    }

    /// Usage bookkeeping never fails a dispatch.
    fn record_usage(&self, id: &ProjectId, request: &AgentRequest, outcome: &AgentOutcome) {
        let (model, input_tokens, output_tokens) = match &outcome.usage {
            Some(usage) => (usage.model.clone(), usage.input_tokens, usage.output_tokens),
            None => (UNREPORTED_MODEL.to_string(), 0, 0),
        };
        let record = UsageRecord {
            stage: request.stage,
            agent: request.agent.clone(),
            model,
            input_tokens,
            output_tokens,
            duration_secs: outcome.duration.as_secs_f64(),
            success: outcome.success,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.usage.record(id, record) {
            tracing::warn!(project = %id, stage = %request.stage, "usage not recorded: {e}");
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.guard.root())
            .finish_non_exhaustive()
    }
}

/// The validate stage's report: the structured one if the agent sent it,
/// otherwise the artifact parsed as JSON.
fn simulation_report(outcome: &AgentOutcome) -> Option<SimulationReport> {
    outcome
        .report
        .clone()
        .or_else(|| serde_json::from_str(outcome.artifact.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::notify::RecordingSink;
    use crate::state::{DeadLetterFilter, TransitionEvent, TransitionQuery};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    /// Test double: replays scripted outcomes and records every request.
    #[derive(Default)]
    struct ScriptedInvoker {
        script: Mutex<VecDeque<AgentOutcome>>,
        fallback: Option<AgentOutcome>,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedInvoker {
        fn always(outcome: AgentOutcome) -> Self {
            Self {
                fallback: Some(outcome),
                ..Self::default()
            }
        }

        fn scripted(outcomes: Vec<AgentOutcome>, fallback: AgentOutcome) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                fallback: Some(fallback),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<AgentRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedInvoker {
        async fn invoke(&self, request: &AgentRequest) -> AgentOutcome {
            self.requests.lock().unwrap().push(request.clone());
            let scripted = self.script.lock().unwrap().pop_front();
            scripted
                .or_else(|| self.fallback.clone())
                .unwrap_or_else(|| AgentOutcome::failure("script exhausted", false))
        }
    }

    /// Succeeds at every stage and reports `ready` at the validate stage.
    fn happy_path() -> ScriptedInvoker {
        ScriptedInvoker::always(
            AgentOutcome::success("artifact body").with_report(SimulationReport::ready()),
        )
    }

    struct Harness {
        _dir: TempDir,
        dispatcher: Dispatcher,
        sink: Arc<RecordingSink>,
        invoker: Arc<ScriptedInvoker>,
    }

    fn harness_with(invoker: ScriptedInvoker, tune: impl FnOnce(&mut EngineConfig)) -> Harness {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.store.root = dir.path().join("projects");
        tune(&mut config);
        let state = Arc::new(StateManager::open(Arc::new(config)).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let invoker = Arc::new(invoker);
        let dispatcher = Dispatcher::new(state, invoker.clone(), sink.clone()).unwrap();
        Harness {
            _dir: dir,
            dispatcher,
            sink,
            invoker,
        }
    }

    fn harness(invoker: ScriptedInvoker) -> Harness {
        harness_with(invoker, |_| {})
    }

    fn pid(n: u32) -> ProjectId {
        ProjectId::parse(&format!("project-{}", n)).unwrap()
    }

    #[tokio::test]
    async fn dispatch_runs_the_current_stage_and_writes_the_artifact() {
        let h = harness(happy_path());
        h.dispatcher.state().initialize_project("project-42").unwrap();

        let outcome = h
            .dispatcher
            .dispatch(&DispatchRequest::new("project-42"))
            .await
            .unwrap();
        let DispatchOutcome::Completed { stage, next, artifact } = outcome else {
            panic!("Expected Completed, got {outcome:?}");
        };
        assert_eq!(stage, Stage::Intake);
        assert_eq!(next, Some(Stage::Specify));
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "artifact body");
        assert!(artifact.ends_with("project-42/artifacts/intake.md"));

        let project = h.dispatcher.state().get_state(&pid(42)).unwrap();
        assert_eq!(project.current_stage, Stage::Specify);
        assert_eq!(project.agent_invocations, 1);
        assert_eq!(project.stages_completed, vec![Stage::Intake]);
        assert_eq!(h.invoker.requests()[0].agent, "triage");
    }

    #[tokio::test]
    async fn traversal_shaped_id_is_rejected_without_writes() {
        let h = harness(happy_path());
        let err = h
            .dispatcher
            .dispatch(&DispatchRequest::new("../../etc"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidProjectId(_)));
        assert!(h.invoker.requests().is_empty());
        let entries = std::fs::read_dir(h.dispatcher.state().root()).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn context_file_outside_root_is_rejected_before_invocation() {
        let h = harness(happy_path());
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let request = DispatchRequest::new("project-1")
            .with_context_files(vec![PathBuf::from("/etc/passwd")]);

        let err = h.dispatcher.dispatch(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::PathEscape { .. }));
        assert!(h.invoker.requests().is_empty());
        assert_eq!(h.dispatcher.state().get_state(&pid(1)).unwrap().agent_invocations, 0);
    }

    #[tokio::test]
    async fn redispatching_a_completed_stage_is_a_no_op() {
        let h = harness(happy_path());
        h.dispatcher.state().initialize_project("project-1").unwrap();
        h.dispatcher.dispatch(&DispatchRequest::new("project-1")).await.unwrap();

        let again = h
            .dispatcher
            .dispatch(&DispatchRequest::new("project-1").with_stage(Stage::Intake))
            .await
            .unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyCompleted { stage: Stage::Intake });
        assert_eq!(h.invoker.requests().len(), 1);
    }

    #[tokio::test]
    async fn dispatching_a_future_stage_is_an_invalid_transition() {
        let h = harness(happy_path());
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let err = h
            .dispatcher
            .dispatch(&DispatchRequest::new("project-1").with_stage(Stage::Implement))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(h.dispatcher.state().get_state(&pid(1)).unwrap().agent_invocations, 0);
    }

    #[tokio::test]
    async fn retryable_failures_escalate_at_the_consecutive_ceiling() {
        let h = harness(ScriptedInvoker::always(AgentOutcome::failure("rate limited", true)));
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let request = DispatchRequest::new("project-1");

        assert_eq!(
            h.dispatcher.dispatch(&request).await.unwrap(),
            DispatchOutcome::RetryPermitted {
                stage: Stage::Intake,
                remaining: 2
            }
        );
        h.dispatcher.dispatch(&request).await.unwrap();
        let third = h.dispatcher.dispatch(&request).await.unwrap();
        assert!(matches!(third, DispatchOutcome::Escalated { .. }));

        let project = h.dispatcher.state().get_state(&pid(1)).unwrap();
        assert_eq!(project.status, ProjectStatus::Escalated);
        let letters = h
            .dispatcher
            .state()
            .list_dead_letters(&pid(1), &DeadLetterFilter::default())
            .unwrap();
        assert_eq!(letters.len(), 3);
        assert_eq!(letters[2].attempt, 3);
        assert_eq!(h.sink.posted().len(), 1);

        let err = h.dispatcher.dispatch(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::CircuitBreakerTripped { .. }));
    }

    #[tokio::test]
    async fn fatal_failure_fails_the_project() {
        let h = harness(ScriptedInvoker::always(AgentOutcome::failure("bad input", false)));
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let outcome = h.dispatcher.dispatch(&DispatchRequest::new("project-1")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { stage: Stage::Intake, .. }));
        assert!(outcome.is_terminal());
        assert!(h.sink.posted().is_empty());
    }

    #[tokio::test]
    async fn failed_project_is_rejected_before_counting_an_invocation() {
        let h = harness(ScriptedInvoker::always(AgentOutcome::failure("bad input", false)));
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let request = DispatchRequest::new("project-1");
        h.dispatcher.dispatch(&request).await.unwrap();

        for _ in 0..3 {
            let err = h.dispatcher.dispatch(&request).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        }

        assert_eq!(h.invoker.requests().len(), 1);
        let project = h.dispatcher.state().get_state(&pid(1)).unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(project.agent_invocations, 1);
        let invoked = h
            .dispatcher
            .state()
            .get_transitions(
                &pid(1),
                &TransitionQuery {
                    event: Some(TransitionEvent::AgentInvoked),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(invoked.len(), 1);
    }

    #[tokio::test]
    async fn invocation_ceiling_denies_and_escalates() {
        let h = harness_with(happy_path(), |c| c.limits.max_agent_invocations = 2);
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let request = DispatchRequest::new("project-1");

        h.dispatcher.dispatch(&request).await.unwrap();
        h.dispatcher.dispatch(&request).await.unwrap();
        let denied = h.dispatcher.dispatch(&request).await.unwrap();
        assert!(matches!(denied, DispatchOutcome::Escalated { ref reason } if reason.contains("Max agent invocations (2)")));
        assert_eq!(h.invoker.requests().len(), 2);

        let project = h.dispatcher.state().get_state(&pid(1)).unwrap();
        assert_eq!(project.agent_invocations, 2);
        assert!(project.is_escalated());
    }

    #[tokio::test]
    async fn revision_returns_to_refine_stage_with_findings() {
        let findings = vec!["acceptance criteria missing".to_string()];
        let invoker = ScriptedInvoker::scripted(
            vec![
                AgentOutcome::success("intake"),
                AgentOutcome::success("spec v1"),
                AgentOutcome::success("plan v1")
                    .with_report(SimulationReport::needs_revision(findings.clone())),
                AgentOutcome::success("spec v2"),
            ],
            AgentOutcome::success("plan v2").with_report(SimulationReport::ready()),
        );
        let h = harness(invoker);
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let request = DispatchRequest::new("project-1");

        for _ in 0..2 {
            h.dispatcher.dispatch(&request).await.unwrap();
        }
        assert_eq!(
            h.dispatcher.dispatch(&request).await.unwrap(),
            DispatchOutcome::Revised { iteration: 1 }
        );
        assert_eq!(
            h.dispatcher.state().get_state(&pid(1)).unwrap().current_stage,
            Stage::Specify
        );

        h.dispatcher.dispatch(&request).await.unwrap();
        let requests = h.invoker.requests();
        assert_eq!(requests[3].stage, Stage::Specify);
        assert_eq!(requests[3].findings, findings);
        assert_eq!(requests[3].attempt, 2);

        let plan = h.dispatcher.dispatch(&request).await.unwrap();
        assert!(matches!(plan, DispatchOutcome::Completed { stage: Stage::Plan, .. }));
        let revisions = h
            .dispatcher
            .state()
            .get_transitions(
                &pid(1),
                &TransitionQuery {
                    event: Some(TransitionEvent::FeedbackRevision),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(revisions.len(), 1);
    }

    #[tokio::test]
    async fn validate_stage_without_report_is_a_fatal_failure() {
        let h = harness(ScriptedInvoker::always(AgentOutcome::success("not json")));
        h.dispatcher.state().initialize_project("project-1").unwrap();
        let request = DispatchRequest::new("project-1");
        h.dispatcher.dispatch(&request).await.unwrap();
        h.dispatcher.dispatch(&request).await.unwrap();
        let outcome = h.dispatcher.dispatch(&request).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { stage: Stage::Plan, .. }));
    }

    #[tokio::test]
    async fn run_to_completion_finishes_all_stages() {
        let h = harness_with(happy_path(), |c| c.limits.max_agent_invocations = 50);
        let summary = h.dispatcher.run_to_completion("project-7").await.unwrap();

        assert_eq!(summary.project.status, ProjectStatus::Completed);
        assert_eq!(summary.project.stages_completed, Stage::ALL.to_vec());
        assert_eq!(summary.dispatches.len(), Stage::ALL.len());
        assert!(matches!(
            summary.dispatches.last(),
            Some(DispatchOutcome::Completed { next: None, .. })
        ));

        let usage = h.dispatcher.usage().report(&pid(7)).unwrap();
        assert_eq!(usage.totals.requests, Stage::ALL.len() as u64);
    }

    #[tokio::test]
    async fn run_to_completion_is_bounded_by_the_feedback_loop() {
        let h = harness_with(
            ScriptedInvoker::always(
                AgentOutcome::success("x")
                    .with_report(SimulationReport::needs_revision(vec!["still vague".into()])),
            ),
            |c| c.limits.max_agent_invocations = 100,
        );
        let summary = h.dispatcher.run_to_completion("project-3").await.unwrap();
        assert!(summary.project.is_escalated());
        assert!(matches!(summary.dispatches.last(), Some(DispatchOutcome::Escalated { .. })));
        // intake, then (specify, plan) once plus three revisions
        assert_eq!(h.invoker.requests().len(), 1 + 2 * 4);
        assert_eq!(h.sink.posted().len(), 1);
    }

    #[tokio::test]
    async fn run_to_completion_stops_on_escalated_project() {
        let h = harness_with(happy_path(), |c| c.limits.max_agent_invocations = 1);
        let summary = h.dispatcher.run_to_completion("project-9").await.unwrap();
        assert!(summary.project.is_escalated());
        assert_eq!(summary.project.stages_completed, vec![Stage::Intake]);

        let again = h.dispatcher.run_to_completion("project-9").await.unwrap();
        assert!(again.dispatches.is_empty());
    }
}
