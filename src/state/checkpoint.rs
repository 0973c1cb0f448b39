use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::project::{Project, ProjectId};
use crate::stage::Stage;

pub(crate) const CHECKPOINT_DIR: &str = "checkpoints";

/// Full snapshot of a project taken after a stage completion or a feedback
/// revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `chk-<8 hex>`
    pub id: String,
    /// Per-project creation order; storage keys sort by it.
    pub seq: u64,
    pub project_id: ProjectId,
    /// The stage whose completion produced the snapshot.
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub state: Project,
}

impl Checkpoint {
    pub(crate) fn new_id() -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("chk-{}", &hex[..8])
    }

    pub(crate) fn key(seq: u64) -> String {
        format!("{}/{}", CHECKPOINT_DIR, Self::file_name(seq))
    }

    pub(crate) fn file_name(seq: u64) -> String {
        format!("{:012}.json", seq)
    }
}
