//! Engine configuration loaded once at process start from
//! `.stagewarden/stagewarden.toml`.
//!
//! Layering is file → environment (`STAGEWARDEN_ROOT`) → CLI (`--root`).
//! The resulting [`EngineConfig`] is immutable and shared behind an `Arc`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! root = ".stagewarden/projects"
//! lock_timeout_secs = 30
//!
//! [limits]
//! max_agent_invocations = 20
//! max_comments_per_hour = 10
//! max_consecutive_failures = 3
//!
//! [checkpoints]
//! max_retained = 20
//!
//! [feedback]
//! max_iterations = 3
//! refine_stage = "specify"
//! validate_stage = "plan"
//!
//! [feedback.estimates]
//! tolerance_factor = 3.0
//!
//! [feedback.estimates.benchmarks]
//! backend = 8.0
//!
//! [stages.implement]
//! agent = "implementer"
//! description = "Generate source code"
//!
//! [invoker]
//! command = "agent-runner"
//! args = ["--json"]
//! timeout_secs = 1800
//!
//! [escalation]
//! notify = ["oncall"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{PipelineError, Result};
use crate::feedback::graph::EstimatePolicy;
use crate::stage::Stage;

/// Name of the engine's working directory inside a repository.
pub const CONFIG_DIR: &str = ".stagewarden";

/// Name of the configuration file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "stagewarden.toml";

/// Environment variable overriding `[store] root`.
pub const ROOT_ENV: &str = "STAGEWARDEN_ROOT";

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Project-data root; relative paths resolve against the working directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_lock_poll_millis")]
    pub lock_poll_millis: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("projects")
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_lock_poll_millis() -> u64 {
    25
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_poll_millis: default_lock_poll_millis(),
        }
    }
}

/// Circuit breaker ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Lifetime agent invocations per project
    #[serde(default = "default_max_agent_invocations")]
    pub max_agent_invocations: u64,
    /// Comment posts within any rolling hour
    #[serde(default = "default_max_comments_per_hour")]
    pub max_comments_per_hour: u32,
    /// Consecutive failures of one stage before forced escalation
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_max_agent_invocations() -> u64 {
    20
}

fn default_max_comments_per_hour() -> u32 {
    10
}

fn default_max_consecutive_failures() -> u32 {
    3
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_agent_invocations: default_max_agent_invocations(),
            max_comments_per_hour: default_max_comments_per_hour(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

fn default_max_retained() -> usize {
    20
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
        }
    }
}

/// The bounded refinement loop between two adjacent stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Stage re-entered with findings attached (the earlier stage of the pair)
    #[serde(default = "default_refine_stage")]
    pub refine_stage: String,
    /// Stage whose findings decide convergence (the later stage of the pair)
    #[serde(default = "default_validate_stage")]
    pub validate_stage: String,
    #[serde(default)]
    pub estimates: EstimatePolicy,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_refine_stage() -> String {
    Stage::Specify.to_string()
}

fn default_validate_stage() -> String {
    Stage::Plan.to_string()
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            refine_stage: default_refine_stage(),
            validate_stage: default_validate_stage(),
            estimates: EstimatePolicy::default(),
        }
    }
}

/// Agent assignment for one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageAgentConfig {
    /// Agent name handed to the invoker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Task description handed to the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Artifact file name the stage output is stored under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Resolved agent assignment for a stage, with built-in fallbacks applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StageAssignment {
    pub stage: Stage,
    pub agent: String,
    pub description: String,
    pub output: String,
}

/// External agent command used by the process invoker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-invocation limit; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationSection {
    /// Handles mentioned in escalation messages
    #[serde(default)]
    pub notify: Vec<String>,
}

/// The complete stagewarden.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub checkpoints: CheckpointSection,
    #[serde(default)]
    pub feedback: FeedbackSection,
    /// Per-stage overrides keyed by canonical stage name
    #[serde(default)]
    pub stages: BTreeMap<String, StageAgentConfig>,
    #[serde(default)]
    pub invoker: InvokerSection,
    #[serde(default)]
    pub escalation: EscalationSection,
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("failed to parse {}: {}", CONFIG_FILE, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `<base_dir>/.stagewarden/stagewarden.toml`, or defaults when absent.
    pub fn load_or_default(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the full layering: explicit file (or default location), then
    /// the `STAGEWARDEN_ROOT` environment variable, then the CLI root flag.
    /// A relative store root is anchored at `base_dir`.
    pub fn resolve(
        base_dir: &Path,
        config_file: Option<&Path>,
        root_override: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(base_dir)?,
        };

        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                config.store.root = PathBuf::from(root);
            }
        }
        if let Some(root) = root_override {
            config.store.root = root;
        }
        if config.store.root.is_relative() {
            config.store.root = base_dir.join(&config.store.root);
        }
        Ok(config)
    }

    /// Serialize to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipelineError::Config(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, content).map_err(|e| {
            PipelineError::Config(format!("failed to write {}: {}", path.display(), e))
        })
    }

    /// Check every invariant the engine relies on. All problems are reported
    /// together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.limits.max_agent_invocations == 0 {
            problems.push("limits.max_agent_invocations must be at least 1".to_string());
        }
        if self.limits.max_comments_per_hour == 0 {
            problems.push("limits.max_comments_per_hour must be at least 1".to_string());
        }
        if self.limits.max_consecutive_failures == 0 {
            problems.push("limits.max_consecutive_failures must be at least 1".to_string());
        }
        if self.checkpoints.max_retained == 0 {
            problems.push("checkpoints.max_retained must be at least 1".to_string());
        }
        if self.store.lock_timeout_secs == 0 {
            problems.push("store.lock_timeout_secs must be at least 1".to_string());
        }

        for (name, stage) in &self.stages {
            if name.parse::<Stage>().is_err() {
                problems.push(format!("stages.{}: unknown stage name", name));
            }
            if let Some(output) = &stage.output {
                if !is_plain_file_name(output) {
                    problems.push(format!(
                        "stages.{}.output must be a plain file name, got '{}'",
                        name, output
                    ));
                }
            }
        }

        match (
            self.feedback.refine_stage.parse::<Stage>(),
            self.feedback.validate_stage.parse::<Stage>(),
        ) {
            (Ok(refine), Ok(validate)) => {
                if !refine.is_followed_by(validate) {
                    problems.push(format!(
                        "feedback stages must be adjacent with refine first: {} -> {}",
                        refine, validate
                    ));
                }
            }
            (refine, validate) => {
                if refine.is_err() {
                    problems.push(format!(
                        "feedback.refine_stage: unknown stage name '{}'",
                        self.feedback.refine_stage
                    ));
                }
                if validate.is_err() {
                    problems.push(format!(
                        "feedback.validate_stage: unknown stage name '{}'",
                        self.feedback.validate_stage
                    ));
                }
            }
        }

        if let Err(msg) = self.feedback.estimates.validate() {
            problems.push(format!("feedback.estimates: {}", msg));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(problems.join("; ")))
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.store.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.lock_poll_millis.max(1))
    }

    /// The (refine, validate) stage pair under feedback-loop control.
    ///
    /// Only meaningful on a validated config; an unvalidated bad name falls
    /// back to the built-in pair.
    pub fn feedback_pair(&self) -> (Stage, Stage) {
        let refine = self.feedback.refine_stage.parse().unwrap_or(Stage::Specify);
        let validate = self.feedback.validate_stage.parse().unwrap_or(Stage::Plan);
        (refine, validate)
    }

    /// Agent assignment for a stage with built-in fallbacks.
    pub fn assignment(&self, stage: Stage) -> StageAssignment {
        let overrides = self.stages.get(stage.as_str());
        let agent = overrides
            .and_then(|o| o.agent.clone())
            .unwrap_or_else(|| stage.default_agent().to_string());
        let description = overrides
            .and_then(|o| o.description.clone())
            .unwrap_or_else(|| format!("Execute the {} stage", stage));
        let output = overrides
            .and_then(|o| o.output.clone())
            .unwrap_or_else(|| format!("{}.md", stage));
        StageAssignment {
            stage,
            agent,
            description,
            output,
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
}
