use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use super::checkpoint::{CHECKPOINT_DIR, Checkpoint};
use super::dead_letter::{DEAD_LETTER_DIR, DeadLetter, DeadLetterFilter, DeadLetterStats, StageFailure};
use super::project::{ErrorEntry, EscalationCause, Project, ProjectId, ProjectStatus};
use super::transition::{StageTransition, TransitionEvent, TransitionQuery};
use crate::breaker::{self, Ceiling};
use crate::config::EngineConfig;
use crate::errors::{PipelineError, Result};
use crate::stage::Stage;
use crate::store::FileStore;

const STATE_KEY: &str = "state.json";
const TRANSITIONS_KEY: &str = "transitions.jsonl";

/// What `fail_stage` decided for the project.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Retryable failure below the consecutive-failure ceiling; the project
    /// stays `in_progress` on the same stage.
    RetryPermitted { consecutive_failures: u32, remaining: u32 },
    /// Non-retryable failure; the project is `failed`.
    Failed { reason: String },
    /// The consecutive-failure ceiling tripped; the project is `escalated`.
    Escalated { reason: String },
}

/// Side effects collected during a locked mutation and committed with it.
///
/// Commit order is new records, then audit lines, then `state.json`. The
/// state overwrite is the commit point; everything before it is rolled back
/// if it fails.
pub(crate) struct Effects {
    now: DateTime<Utc>,
    records: Vec<(String, Vec<u8>)>,
    transitions: Vec<StageTransition>,
    checkpointed: bool,
}

impl Effects {
    fn new() -> Self {
        Self {
            now: Utc::now(),
            records: Vec::new(),
            transitions: Vec::new(),
            checkpointed: false,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn log(&mut self, transition: StageTransition) {
        self.transitions.push(transition);
    }

    fn record<T: Serialize>(&mut self, key: String, value: &T) -> Result<()> {
        let bytes = encode(&key, value)?;
        self.records.push((key, bytes));
        Ok(())
    }

    /// Snapshot `project` as a new checkpoint after `stage`. The caller sets
    /// `recovery_info.resume_from_stage` first.
    pub(crate) fn checkpoint(&mut self, project: &mut Project, stage: Stage) -> Result<String> {
        let seq = project.checkpoint_seq + 1;
        let id = Checkpoint::new_id();
        project.checkpoint_seq = seq;
        project.recovery_info.last_checkpoint = Some(id.clone());

        let checkpoint = Checkpoint {
            id: id.clone(),
            seq,
            project_id: project.id.clone(),
            stage,
            created_at: self.now,
            state: project.clone(),
        };
        self.record(Checkpoint::key(seq), &checkpoint)?;
        self.log(
            StageTransition::new(&project.id, stage, TransitionEvent::CheckpointCreated, self.now)
                .with_details(serde_json::json!({
                    "checkpoint_id": id,
                    "resume_from_stage": project.recovery_info.resume_from_stage,
                })),
        );
        self.checkpointed = true;
        Ok(id)
    }
}

/// Owns every project's persisted state.
///
/// Each public operation runs under the project's lock for its full
/// duration, reads included.
#[derive(Debug)]
pub struct StateManager {
    store: FileStore,
    config: Arc<EngineConfig>,
}

impl StateManager {
    /// Open the store at the configured project-data root.
    pub fn open(config: Arc<EngineConfig>) -> Result<Self> {
        let store = FileStore::open(
            &config.store.root,
            config.lock_timeout(),
            config.lock_poll_interval(),
        )?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Canonical project-data root.
    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn initialize_project(&self, raw_id: &str) -> Result<Project> {
        let id = ProjectId::parse(raw_id)?;
        let ns = id.as_str();
        self.store.with_lock(ns, || {
            if self.load(&id)?.is_some() || !self.store.list(ns, CHECKPOINT_DIR)?.is_empty() {
                return Err(PipelineError::AlreadyExists(id.to_string()));
            }
            let mut effects = Effects::new();
            let project = Project::new(id.clone(), effects.now);
            effects.log(StageTransition::new(
                &id,
                project.current_stage,
                TransitionEvent::ProjectInitialized,
                effects.now,
            ));
            self.commit(&project, effects)?;
            tracing::info!(project = %id, stage = %project.current_stage, "project initialized");
            Ok(project)
        })
    }

    pub fn start_stage(&self, id: &ProjectId, stage: Stage, agent: &str) -> Result<Project> {
        self.mutate(id, |project, fx| {
            project.ensure_active()?;
            if stage != project.current_stage {
                return Err(PipelineError::unexpected_stage(id, project.current_stage, stage));
            }
            let now = fx.now();
            let record = project.stages.entry(stage).or_default();
            record.started_at = Some(now);
            record.completed_at = None;
            record.duration_secs = None;
            record.agent = Some(agent.to_string());
            record.attempts += 1;
            record.running = true;
            let attempt = record.attempts;

            project.status = ProjectStatus::InProgress;
            project.status_reason = None;
            fx.log(
                StageTransition::new(id, stage, TransitionEvent::Start, now)
                    .with_agent(agent)
                    .with_details(serde_json::json!({ "attempt": attempt })),
            );
            tracing::info!(project = %id, %stage, agent, attempt, "stage started");
            Ok(project.clone())
        })
    }

    pub fn complete_stage(&self, id: &ProjectId, stage: Stage, agent: &str) -> Result<Project> {
        self.complete_stage_with_artifacts(id, stage, agent, &[])
    }

    /// Complete the running stage, recording the artifact names it produced.
    pub fn complete_stage_with_artifacts(
        &self,
        id: &ProjectId,
        stage: Stage,
        agent: &str,
        artifacts: &[String],
    ) -> Result<Project> {
        self.mutate(id, |project, fx| {
            ensure_running(project, stage)?;
            let now = fx.now();
            let record = project.stages.entry(stage).or_default();
            let duration = record.started_at.map(|started| elapsed_secs(started, now));
            record.completed_at = Some(now);
            record.duration_secs = duration;
            record.agent = Some(agent.to_string());
            record.running = false;

            project.stages_completed.push(stage);
            project.safety.consecutive_failures.remove(&stage);
            match stage.next() {
                Some(next) => {
                    project.current_stage = next;
                    project.status = ProjectStatus::InProgress;
                    project.recovery_info.resume_from_stage = Some(next);
                }
                None => {
                    project.status = ProjectStatus::Completed;
                    project.status_reason = None;
                    project.recovery_info.resume_from_stage = None;
                }
            }

            let mut transition = StageTransition::new(id, stage, TransitionEvent::Complete, now)
                .with_agent(agent)
                .with_duration(duration);
            if !artifacts.is_empty() {
                transition = transition.with_details(serde_json::json!({ "artifacts": artifacts }));
            }
            fx.log(transition);
            let checkpoint = fx.checkpoint(project, stage)?;
            tracing::info!(
                project = %id,
                %stage,
                next = %project.current_stage,
                %checkpoint,
                duration_secs = duration.unwrap_or_default(),
                "stage completed"
            );
            Ok(project.clone())
        })
    }

    /// Record a failed attempt of the running stage.
    ///
    /// Always writes an error entry, a `fail` transition and a dead letter.
    /// The consecutive-failure ceiling is counted in the same critical
    /// section and takes precedence over the retryable flag.
    pub fn fail_stage(
        &self,
        id: &ProjectId,
        stage: Stage,
        agent: &str,
        failure: StageFailure,
    ) -> Result<FailureOutcome> {
        let limits = self.config.limits.clone();
        self.mutate(id, |project, fx| {
            ensure_running(project, stage)?;
            let now = fx.now();
            let record = project.stages.entry(stage).or_default();
            let attempt = record.attempts.max(1);
            let duration = record.started_at.map(|started| elapsed_secs(started, now));
            record.running = false;

            project.errors.push(ErrorEntry {
                stage,
                message: failure.message.clone(),
                timestamp: now,
            });

            let outcome = match breaker::record_failure(&mut project.safety, stage, &limits) {
                Some(reason) => {
                    project.escalate(
                        EscalationCause::Breaker {
                            ceiling: Ceiling::ConsecutiveFailures,
                        },
                        &reason,
                        now,
                    );
                    FailureOutcome::Escalated { reason }
                }
                None if !failure.retryable => {
                    let reason = format!("Stage '{}' failed: {}", stage, failure.message);
                    project.status = ProjectStatus::Failed;
                    project.status_reason = Some(reason.clone());
                    FailureOutcome::Failed { reason }
                }
                None => {
                    let failures = project
                        .safety
                        .consecutive_failures
                        .get(&stage)
                        .copied()
                        .unwrap_or_default();
                    FailureOutcome::RetryPermitted {
                        consecutive_failures: failures,
                        remaining: limits.max_consecutive_failures.saturating_sub(failures),
                    }
                }
            };

            let letter_id = Uuid::new_v4().simple().to_string();
            fx.log(
                StageTransition::new(id, stage, TransitionEvent::Fail, now)
                    .with_agent(agent)
                    .with_duration(duration)
                    .with_details(serde_json::json!({
                        "error": failure.message,
                        "retryable": failure.retryable,
                        "attempt": attempt,
                        "dead_letter_id": letter_id,
                    })),
            );
            if let FailureOutcome::Escalated { reason } = &outcome {
                fx.log(
                    StageTransition::new(id, stage, TransitionEvent::Escalated, now)
                        .with_agent(agent)
                        .with_details(serde_json::json!({
                            "ceiling": Ceiling::ConsecutiveFailures,
                            "reason": reason,
                        })),
                );
            }

            project.dead_letter_seq += 1;
            let letter = DeadLetter {
                id: letter_id,
                seq: project.dead_letter_seq,
                project_id: id.clone(),
                stage,
                agent: agent.to_string(),
                error: failure.message.clone(),
                retryable: failure.retryable,
                attempt,
                context: failure.context.clone(),
                state_snapshot: project.clone(),
                timestamp: now,
            };
            fx.record(DeadLetter::key(letter.seq, &letter.id), &letter)?;

            match &outcome {
                FailureOutcome::RetryPermitted { remaining, .. } => {
                    tracing::warn!(project = %id, %stage, agent, attempt, remaining, "stage failed, retry permitted: {}", failure.message)
                }
                FailureOutcome::Failed { reason } => {
                    tracing::error!(project = %id, %stage, agent, attempt, "{reason}")
                }
                FailureOutcome::Escalated { reason } => {
                    tracing::error!(project = %id, %stage, agent, attempt, "escalated: {reason}")
                }
            }
            Ok(outcome)
        })
    }

    /// Merge `patch` into the project's metadata (RFC 7386 merge patch:
    /// objects merge recursively, `null` deletes, anything else replaces).
    pub fn update_state(&self, id: &ProjectId, patch: &Value) -> Result<Project> {
        let Some(entries) = patch.as_object() else {
            return Err(PipelineError::invalid_transition(
                id,
                "state patch must be a JSON object",
            ));
        };
        let keys: Vec<&String> = entries.keys().collect();
        let details = serde_json::json!({ "keys": keys });
        self.update_metadata(id, details, |metadata| {
            let mut target = Value::Object(std::mem::take(metadata));
            merge_patch(&mut target, patch);
            if let Value::Object(merged) = target {
                *metadata = merged;
            }
            Ok(())
        })?;
        self.get_state(id)
    }

    /// Locked read-modify-write of the metadata map, logged as `state_updated`.
    pub(crate) fn update_metadata<T, F>(&self, id: &ProjectId, details: Value, f: F) -> Result<T>
    where
        F: FnOnce(&mut serde_json::Map<String, Value>) -> Result<T>,
    {
        self.mutate(id, |project, fx| {
            let out = f(&mut project.metadata)?;
            fx.log(
                StageTransition::new(id, project.current_stage, TransitionEvent::StateUpdated, fx.now())
                    .with_details(details),
            );
            Ok(out)
        })
    }

    pub fn get_state(&self, id: &ProjectId) -> Result<Project> {
        self.store.with_lock(id.as_str(), || self.load_required(id))
    }

    pub fn exists(&self, id: &ProjectId) -> Result<bool> {
        self.store
            .with_lock(id.as_str(), || Ok(self.load(id)?.is_some()))
    }

    /// Retained checkpoints, oldest first.
    pub fn list_checkpoints(&self, id: &ProjectId) -> Result<Vec<Checkpoint>> {
        self.store.with_lock(id.as_str(), || {
            self.ensure_known(id)?;
            self.read_collection(id, CHECKPOINT_DIR)
        })
    }

    pub fn latest_checkpoint(&self, id: &ProjectId) -> Result<Option<Checkpoint>> {
        self.store.with_lock(id.as_str(), || {
            self.ensure_known(id)?;
            self.read_latest_checkpoint(id)
        })
    }

    /// Dead letters in the order they were recorded.
    pub fn list_dead_letters(
        &self,
        id: &ProjectId,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetter>> {
        self.store.with_lock(id.as_str(), || {
            self.ensure_known(id)?;
            let letters: Vec<DeadLetter> = self.read_collection(id, DEAD_LETTER_DIR)?;
            Ok(letters.into_iter().filter(|l| filter.matches(l)).collect())
        })
    }

    pub fn dead_letter_stats(&self, id: &ProjectId) -> Result<DeadLetterStats> {
        let letters = self.list_dead_letters(id, &DeadLetterFilter::default())?;
        Ok(DeadLetterStats::from_letters(&letters))
    }

    /// Audit log records matching `query`, chronological.
    pub fn get_transitions(
        &self,
        id: &ProjectId,
        query: &TransitionQuery,
    ) -> Result<Vec<StageTransition>> {
        self.store.with_lock(id.as_str(), || {
            self.ensure_known(id)?;
            let Some(bytes) = self.store.read(id.as_str(), TRANSITIONS_KEY)? else {
                return Ok(Vec::new());
            };
            let mut transitions = Vec::new();
            for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                let key = format!("{}:{}", TRANSITIONS_KEY, index + 1);
                transitions.push(decode::<StageTransition>(&key, line)?);
            }
            Ok(query.apply(transitions))
        })
    }

    /// Restore progress from the most recent checkpoint.
    ///
    /// Progress fields (`current_stage`, `stages_completed`,
    /// `recovery_info`) come from the checkpoint. Monotonic data (invocation
    /// count, errors, breaker counters, feedback-loop state, metadata) is
    /// kept from the current record so recovery never resets a ceiling. A
    /// missing or corrupt state record is rebuilt from the checkpoint alone.
    /// An escalated project stays escalated; otherwise the status becomes
    /// `pending`, or `completed` if the pipeline had finished.
    pub fn recover(&self, id: &ProjectId) -> Result<Project> {
        self.store.with_lock(id.as_str(), || {
            let (current, load_error) = match self.load(id) {
                Ok(current) => (current, None),
                Err(err @ PipelineError::CorruptRecord { .. }) => {
                    tracing::error!(project = %id, "state record unreadable, recovering from checkpoint: {err}");
                    (None, Some(err))
                }
                Err(err) => return Err(err),
            };
            let latest = self.read_latest_checkpoint(id)?;

            let mut effects = Effects::new();
            let (mut project, checkpoint_id) = match (current, latest) {
                (None, None) => {
                    return Err(load_error.unwrap_or_else(|| PipelineError::NotFound(id.to_string())));
                }
                (Some(current), None) => (current, None),
                (None, Some(checkpoint)) => {
                    let mut rebuilt = checkpoint.state;
                    rebuilt.checkpoint_seq = rebuilt.checkpoint_seq.max(checkpoint.seq);
                    (rebuilt, Some(checkpoint.id))
                }
                (Some(mut current), Some(checkpoint)) => {
                    current.current_stage = checkpoint.state.current_stage;
                    current.stages_completed = checkpoint.state.stages_completed;
                    current.recovery_info = checkpoint.state.recovery_info;
                    current.checkpoint_seq = current.checkpoint_seq.max(checkpoint.seq);
                    (current, Some(checkpoint.id))
                }
            };
            project.dead_letter_seq = project.dead_letter_seq.max(self.last_dead_letter_seq(id)?);
            project.last_updated = effects.now;
            for record in project.stages.values_mut() {
                record.running = false;
            }

            if !project.is_escalated() {
                project.status = if project.recovery_info.resume_from_stage.is_none() {
                    ProjectStatus::Completed
                } else {
                    ProjectStatus::Pending
                };
                project.status_reason = None;
            }

            effects.log(
                StageTransition::new(id, project.current_stage, TransitionEvent::Recovered, effects.now)
                    .with_details(serde_json::json!({
                        "checkpoint_id": checkpoint_id,
                        "resume_from_stage": project.recovery_info.resume_from_stage,
                        "status": project.status,
                    })),
            );
            self.commit(&project, effects)?;
            tracing::info!(
                project = %id,
                stage = %project.current_stage,
                status = %project.status,
                checkpoint = checkpoint_id.as_deref().unwrap_or("none"),
                "project recovered"
            );
            Ok(project)
        })
    }

    /// Locked read-modify-write of a project record.
    ///
    /// `f` mutates the loaded record and queues side effects on `Effects`.
    /// If `f` fails nothing is written; otherwise the side effects and the
    /// new state are committed as one unit.
    pub(crate) fn mutate<T, F>(&self, id: &ProjectId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Project, &mut Effects) -> Result<T>,
    {
        self.store.with_lock(id.as_str(), || {
            let mut project = self.load_required(id)?;
            let mut effects = Effects::new();
            project.last_updated = effects.now;
            let out = f(&mut project, &mut effects)?;
            self.commit(&project, effects)?;
            Ok(out)
        })
    }

    fn commit(&self, project: &Project, effects: Effects) -> Result<()> {
        let ns = project.id.as_str();
        let mut batch = self.store.batch(ns);
        for (key, bytes) in &effects.records {
            batch.create(key, bytes)?;
        }
        for transition in &effects.transitions {
            let line = serde_json::to_vec(transition).map_err(|source| PipelineError::CorruptRecord {
                key: TRANSITIONS_KEY.to_string(),
                source,
            })?;
            batch.append_line(TRANSITIONS_KEY, &line)?;
        }
        batch.commit(STATE_KEY, &encode(STATE_KEY, project)?)?;

        if effects.checkpointed {
            if let Err(e) = self.prune_checkpoints(&project.id) {
                tracing::warn!(project = %project.id, "checkpoint rotation failed: {e}");
            }
        }
        Ok(())
    }

    /// Delete the oldest checkpoints beyond the retention limit.
    fn prune_checkpoints(&self, id: &ProjectId) -> Result<()> {
        let names = self.store.list(id.as_str(), CHECKPOINT_DIR)?;
        let excess = names.len().saturating_sub(self.config.checkpoints.max_retained);
        for name in &names[..excess] {
            self.store
                .remove(id.as_str(), &format!("{}/{}", CHECKPOINT_DIR, name))?;
            tracing::debug!(project = %id, checkpoint = %name, "rotated out checkpoint");
        }
        Ok(())
    }

    fn load(&self, id: &ProjectId) -> Result<Option<Project>> {
        match self.store.read(id.as_str(), STATE_KEY)? {
            Some(bytes) => decode(STATE_KEY, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load_required(&self, id: &ProjectId) -> Result<Project> {
        self.load(id)?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    fn ensure_known(&self, id: &ProjectId) -> Result<()> {
        if self.store.namespace_exists(id.as_str())? {
            Ok(())
        } else {
            Err(PipelineError::NotFound(id.to_string()))
        }
    }

    fn read_collection<T: DeserializeOwned>(&self, id: &ProjectId, collection: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for name in self.store.list(id.as_str(), collection)? {
            let key = format!("{}/{}", collection, name);
            if let Some(bytes) = self.store.read(id.as_str(), &key)? {
                items.push(decode(&key, &bytes)?);
            }
        }
        Ok(items)
    }

    fn read_latest_checkpoint(&self, id: &ProjectId) -> Result<Option<Checkpoint>> {
        let names = self.store.list(id.as_str(), CHECKPOINT_DIR)?;
        let Some(name) = names.last() else {
            return Ok(None);
        };
        let key = format!("{}/{}", CHECKPOINT_DIR, name);
        match self.store.read(id.as_str(), &key)? {
            Some(bytes) => decode(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn last_dead_letter_seq(&self, id: &ProjectId) -> Result<u64> {
        let names = self.store.list(id.as_str(), DEAD_LETTER_DIR)?;
        Ok(names
            .last()
            .and_then(|name| name.split('-').next())
            .and_then(|seq| seq.parse().ok())
            .unwrap_or(0))
    }
}

/// Require `stage` to be the current, started stage.
fn ensure_running(project: &Project, stage: Stage) -> Result<()> {
    project.ensure_active()?;
    if stage != project.current_stage {
        return Err(PipelineError::unexpected_stage(
            &project.id,
            project.current_stage,
            stage,
        ));
    }
    if !project.is_running(stage) {
        return Err(PipelineError::invalid_transition(
            &project.id,
            format!("stage '{}' has not been started", stage),
        ));
    }
    Ok(())
}

fn elapsed_secs(started: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - started).num_milliseconds().max(0) as f64 / 1000.0
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|source| PipelineError::CorruptRecord {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|source| PipelineError::CorruptRecord {
        key: key.to_string(),
        source,
    })
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}
