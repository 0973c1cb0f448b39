//! Audit log records, one JSON object per line in `transitions.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::project::ProjectId;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    Start,
    Complete,
    Fail,
    ProjectInitialized,
    CheckpointCreated,
    StateUpdated,
    Escalated,
    EscalationResolved,
    FeedbackRevision,
    Recovered,
    BreakerReset,
    AgentInvoked,
}

impl TransitionEvent {
    pub const ALL: [TransitionEvent; 12] = [
        Self::Start,
        Self::Complete,
        Self::Fail,
        Self::ProjectInitialized,
        Self::CheckpointCreated,
        Self::StateUpdated,
        Self::Escalated,
        Self::EscalationResolved,
        Self::FeedbackRevision,
        Self::Recovered,
        Self::BreakerReset,
        Self::AgentInvoked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::ProjectInitialized => "project_initialized",
            Self::CheckpointCreated => "checkpoint_created",
            Self::StateUpdated => "state_updated",
            Self::Escalated => "escalated",
            Self::EscalationResolved => "escalation_resolved",
            Self::FeedbackRevision => "feedback_revision",
            Self::Recovered => "recovered",
            Self::BreakerReset => "breaker_reset",
            Self::AgentInvoked => "agent_invoked",
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown transition event '{}'", s))
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub project_id: ProjectId,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub event_type: TransitionEvent,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the stage started, on `complete` and `fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageTransition {
    pub fn new(
        project_id: &ProjectId,
        stage: Stage,
        event_type: TransitionEvent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            project_id: project_id.clone(),
            stage,
            agent: None,
            event_type,
            timestamp,
            duration_secs: None,
            details: None,
        }
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn with_duration(mut self, secs: Option<f64>) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filter for [`StateManager::get_transitions`](super::StateManager::get_transitions).
#[derive(Debug, Clone, Default)]
pub struct TransitionQuery {
    pub event: Option<TransitionEvent>,
    pub stage: Option<Stage>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl TransitionQuery {
    pub fn matches(&self, transition: &StageTransition) -> bool {
        self.event.is_none_or(|e| e == transition.event_type)
            && self.stage.is_none_or(|s| s == transition.stage)
    }

    /// Filter chronologically ordered records, preserving their order.
    pub fn apply(&self, transitions: Vec<StageTransition>) -> Vec<StageTransition> {
        let mut matched: Vec<_> = transitions.into_iter().filter(|t| self.matches(t)).collect();
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: Stage, event: TransitionEvent) -> StageTransition {
        StageTransition::new(
            &ProjectId::parse("project-1").unwrap(),
            stage,
            event,
            Utc::now(),
        )
    }

    #[test]
    fn event_names_are_snake_case() {
        let json = serde_json::to_string(&TransitionEvent::CheckpointCreated).unwrap();
        assert_eq!(json, "\"checkpoint_created\"");
        for event in TransitionEvent::ALL {
            assert_eq!(event.as_str().parse::<TransitionEvent>().unwrap(), event);
        }
        assert!("finish".parse::<TransitionEvent>().is_err());
    }

    #[test]
    fn query_filters_and_keeps_most_recent() {
        let log = vec![
            record(Stage::Intake, TransitionEvent::Start),
            record(Stage::Intake, TransitionEvent::Complete),
            record(Stage::Specify, TransitionEvent::Start),
            record(Stage::Specify, TransitionEvent::Fail),
            record(Stage::Specify, TransitionEvent::Start),
        ];

        let starts = TransitionQuery {
            event: Some(TransitionEvent::Start),
            ..Default::default()
        }
        .apply(log.clone());
        assert_eq!(starts.len(), 3);

        let recent_specify = TransitionQuery {
            stage: Some(Stage::Specify),
            limit: Some(2),
            ..Default::default()
        }
        .apply(log);
        assert_eq!(recent_specify.len(), 2);
        assert_eq!(recent_specify[0].event_type, TransitionEvent::Fail);
        assert_eq!(recent_specify[1].event_type, TransitionEvent::Start);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let line = serde_json::to_string(&record(Stage::Plan, TransitionEvent::Start)).unwrap();
        assert!(!line.contains("duration_secs"));
        assert!(!line.contains("details"));
        let with = record(Stage::Plan, TransitionEvent::Complete)
            .with_agent("simulator")
            .with_duration(Some(1.5));
        let line = serde_json::to_string(&with).unwrap();
        assert!(line.contains("\"agent\":\"simulator\""));
        assert!(line.contains("\"duration_secs\":1.5"));
    }
}
