//! Per-invocation model usage, kept on the project record under
//! `metadata.usage`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{PipelineError, Result};
use crate::stage::Stage;
use crate::state::{ProjectId, StateManager};

/// Metadata key holding the usage records.
pub const USAGE_KEY: &str = "usage";

/// Model name recorded when an agent reports no usage.
pub const UNREPORTED_MODEL: &str = "unreported";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub stage: Stage,
    pub agent: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub duration_secs: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub successes: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_secs: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        if record.success {
            self.successes += 1;
        }
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.duration_secs += record.duration_secs;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fraction of successful requests, 0.0 when there are none.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub by_model: BTreeMap<String, UsageTotals>,
    pub by_stage: BTreeMap<Stage, UsageTotals>,
    pub totals: UsageTotals,
}

impl UsageReport {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let mut report = Self::default();
        for record in records {
            report.by_model.entry(record.model.clone()).or_default().add(record);
            report.by_stage.entry(record.stage).or_default().add(record);
            report.totals.add(record);
        }
        report
    }
}

/// Records usage through the state manager's metadata updates.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    state: Arc<StateManager>,
}

impl UsageTracker {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    pub fn record(&self, id: &ProjectId, record: UsageRecord) -> Result<()> {
        let details = serde_json::json!({
            "usage": {
                "stage": record.stage,
                "model": record.model,
                "tokens": record.total_tokens(),
                "success": record.success,
            }
        });
        self.state.update_metadata(id, details, |metadata| {
            let encoded = serde_json::to_value(&record).map_err(|source| PipelineError::CorruptRecord {
                key: format!("metadata.{}", USAGE_KEY),
                source,
            })?;
            match metadata
                .entry(USAGE_KEY)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                Value::Array(entries) => entries.push(encoded),
                other => *other = Value::Array(vec![encoded]),
            }
            Ok(())
        })?;
        tracing::debug!(project = %id, stage = %record.stage, model = %record.model, tokens = record.total_tokens(), "usage recorded");
        Ok(())
    }

    /// All usage records for a project. Entries that do not decode are skipped.
    pub fn records(&self, id: &ProjectId) -> Result<Vec<UsageRecord>> {
        let project = self.state.get_state(id)?;
        let Some(Value::Array(entries)) = project.metadata.get(USAGE_KEY) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(project = %id, "skipping malformed usage entry: {e}");
                    None
                }
            })
            .collect())
    }

    pub fn report(&self, id: &ProjectId) -> Result<UsageReport> {
        Ok(UsageReport::from_records(&self.records(id)?))
    }
}
