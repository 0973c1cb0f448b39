//! Project state machine and its persisted records.
//!
//! Per project the store holds:
//!
//! ```text
//! <root>/project-N/
//! ├── state.json                 # current snapshot, overwritten atomically
//! ├── transitions.jsonl          # append-only audit log
//! ├── checkpoints/<seq>.json     # bounded, rotated oldest-first
//! ├── dead_letters/<seq>-<id>.json  # unbounded, never deleted
//! └── artifacts/                 # stage outputs written by the dispatcher
//! ```

mod checkpoint;
mod dead_letter;
mod manager;
mod project;
mod transition;

pub use checkpoint::Checkpoint;
pub use dead_letter::{DeadLetter, DeadLetterFilter, DeadLetterStats, StageFailure};
pub use manager::{FailureOutcome, StateManager};
pub use project::{
    ErrorEntry, Escalation, EscalationCause, Project, ProjectId, ProjectStatus, RecoveryInfo,
    StageRecord,
};
pub use transition::{StageTransition, TransitionEvent, TransitionQuery};

/// Subdirectory of a project holding stage artifacts.
pub const ARTIFACT_DIR: &str = "artifacts";
