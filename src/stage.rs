//! The fixed, linear stage ordering every project moves through.
//!
//! Stages are a closed enumeration: an unknown or misspelled stage name is a
//! parse error (and a configuration error when it appears in config), never a
//! silently ignored string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PipelineError;

/// One step of the pipeline, declared in pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Specify,
    Plan,
    Decompose,
    Implement,
    Verify,
    Integrate,
    Harden,
    Release,
    Operate,
    Analyze,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 11] = [
        Stage::Intake,
        Stage::Specify,
        Stage::Plan,
        Stage::Decompose,
        Stage::Implement,
        Stage::Verify,
        Stage::Integrate,
        Stage::Harden,
        Stage::Release,
        Stage::Operate,
        Stage::Analyze,
    ];

    pub fn first() -> Stage {
        Stage::ALL[0]
    }

    pub fn last() -> Stage {
        Stage::ALL[Stage::ALL.len() - 1]
    }

    /// Zero-based position in the ordering.
    pub fn position(self) -> usize {
        self as usize
    }

    /// The stage that follows this one, or `None` for the final stage.
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.position() + 1).copied()
    }

    /// The stage that precedes this one, or `None` for the first stage.
    pub fn previous(self) -> Option<Stage> {
        self.position().checked_sub(1).map(|i| Stage::ALL[i])
    }

    /// Whether `other` immediately follows `self`.
    pub fn is_followed_by(self, other: Stage) -> bool {
        self.next() == Some(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Specify => "specify",
            Stage::Plan => "plan",
            Stage::Decompose => "decompose",
            Stage::Implement => "implement",
            Stage::Verify => "verify",
            Stage::Integrate => "integrate",
            Stage::Harden => "harden",
            Stage::Release => "release",
            Stage::Operate => "operate",
            Stage::Analyze => "analyze",
        }
    }

    /// Built-in agent assignment used when configuration omits a stage.
    pub fn default_agent(self) -> &'static str {
        match self {
            Stage::Intake => "triage",
            Stage::Specify => "specifier",
            Stage::Plan => "simulator",
            Stage::Decompose => "planner",
            Stage::Implement => "implementer",
            Stage::Verify => "tester",
            Stage::Integrate => "merger",
            Stage::Harden => "security",
            Stage::Release => "deployer",
            Stage::Operate => "operator",
            Stage::Analyze => "analyzer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    /// Exact, case-sensitive match against the canonical stage names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidStage(s.to_string()))
    }
}
