//! Retained records of failed stage attempts.
//!
//! Dead letters are write-once: each one gets its own key and nothing in the
//! engine ever overwrites or deletes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::project::{Project, ProjectId};
use crate::stage::Stage;

pub(crate) const DEAD_LETTER_DIR: &str = "dead_letters";

/// What the caller reports about a failed attempt.
#[derive(Debug, Clone, Default)]
pub struct StageFailure {
    pub message: String,
    /// Whether another attempt may succeed (transient failure).
    pub retryable: bool,
    /// Caller-supplied context kept with the dead letter.
    pub context: serde_json::Value,
}

impl StageFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            context: serde_json::Value::Null,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub seq: u64,
    pub project_id: ProjectId,
    pub stage: Stage,
    pub agent: String,
    pub error: String,
    pub retryable: bool,
    /// Which attempt of the stage failed, starting at 1.
    pub attempt: u32,
    #[serde(default)]
    pub context: serde_json::Value,
    /// Project state right after the failure was recorded.
    pub state_snapshot: Project,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub(crate) fn key(seq: u64, id: &str) -> String {
        format!("{}/{:012}-{}.json", DEAD_LETTER_DIR, seq, id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub stage: Option<Stage>,
    pub agent: Option<String>,
}

impl DeadLetterFilter {
    pub fn matches(&self, letter: &DeadLetter) -> bool {
        self.stage.is_none_or(|s| s == letter.stage)
            && self.agent.as_deref().is_none_or(|a| a == letter.agent)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_stage: BTreeMap<Stage, usize>,
    pub by_agent: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DateTime<Utc>>,
}

impl DeadLetterStats {
    pub fn from_letters(letters: &[DeadLetter]) -> Self {
        let mut stats = Self::default();
        for letter in letters {
            stats.total += 1;
            *stats.by_stage.entry(letter.stage).or_default() += 1;
            *stats.by_agent.entry(letter.agent.clone()).or_default() += 1;
            if stats.latest.is_none_or(|t| letter.timestamp > t) {
                stats.latest = Some(letter.timestamp);
            }
        }
        stats
    }
}
