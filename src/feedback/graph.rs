//! Task-graph checks run on validation output before the feedback loop may
//! converge.
//!
//! Each check is a pure function over a [`TaskGraph`]:
//! - [`find_cycles`] — circular dependencies (iterative depth-first search)
//! - [`find_orphans`] — tasks unreachable from the declared entry points
//! - [`find_missing_dependencies`] — references to undeclared tasks
//! - [`find_estimate_outliers`] — estimates far from category benchmarks
//!
//! The first three block convergence. Estimate outliers are advisory only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// One unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_hours: Option<f64>,
    /// Benchmark category used by the estimate check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub tasks: Vec<Task>,
    /// Tasks work starts from. When empty, every task without dependencies
    /// is treated as an entry point.
    #[serde(default)]
    pub entry_points: Vec<String>,
}

impl TaskGraph {
    fn index(&self) -> HashMap<&str, &Task> {
        self.tasks.iter().map(|t| (t.id.as_str(), t)).collect()
    }

    fn roots(&self) -> Vec<&str> {
        if self.entry_points.is_empty() {
            self.tasks
                .iter()
                .filter(|t| t.depends_on.is_empty())
                .map(|t| t.id.as_str())
                .collect()
        } else {
            self.entry_points.iter().map(String::as_str).collect()
        }
    }
}

/// Threshold policy for the estimate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatePolicy {
    /// An estimate is an outlier when it differs from its category benchmark
    /// by more than this factor in either direction.
    #[serde(default = "default_tolerance_factor")]
    pub tolerance_factor: f64,
    /// Typical hours per task category.
    #[serde(default)]
    pub benchmarks: BTreeMap<String, f64>,
}

fn default_tolerance_factor() -> f64 {
    3.0
}

impl Default for EstimatePolicy {
    fn default() -> Self {
        Self {
            tolerance_factor: default_tolerance_factor(),
            benchmarks: BTreeMap::new(),
        }
    }
}

impl EstimatePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !self.tolerance_factor.is_finite() || self.tolerance_factor <= 1.0 {
            return Err(format!(
                "tolerance_factor must be a finite number greater than 1 (got {})",
                self.tolerance_factor
            ));
        }
        let bad: Vec<&str> = self
            .benchmarks
            .iter()
            .filter(|(_, hours)| !hours.is_finite() || **hours <= 0.0)
            .map(|(category, _)| category.as_str())
            .collect();
        if !bad.is_empty() {
            return Err(format!(
                "benchmark hours must be positive for: {}",
                bad.join(", ")
            ));
        }
        Ok(())
    }
}

/// A reference to a task that is not declared in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    /// Declaring task id, or `entry_points`.
    pub referenced_by: String,
    pub missing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateOutlier {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub estimate_hours: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_hours: Option<f64>,
    /// estimate / benchmark, when a benchmark applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

/// Every dependency cycle, each listed from its smallest task id with the
/// first id repeated at the end (`a -> b -> a`).
pub fn find_cycles(graph: &TaskGraph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let index = graph.index();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut found = Vec::new();
    for task in &graph.tasks {
        if marks.get(task.id.as_str()).copied().unwrap_or(Mark::Unvisited) != Mark::Unvisited {
            continue;
        }
        // Explicit stack of (task, next dependency to look at); `path` mirrors
        // the ids on it. Agent-produced graphs can be arbitrarily deep.
        let mut frames: Vec<(&str, usize)> = vec![(task.id.as_str(), 0)];
        let mut path: Vec<&str> = vec![task.id.as_str()];
        marks.insert(task.id.as_str(), Mark::OnStack);

        while let Some(frame) = frames.last_mut() {
            let (id, next) = *frame;
            frame.1 += 1;
            let deps = index.get(id).map(|t| t.depends_on.as_slice()).unwrap_or(&[]);
            let Some(dep) = deps.get(next) else {
                frames.pop();
                path.pop();
                marks.insert(id, Mark::Done);
                continue;
            };
            let Some((&dep_key, _)) = index.get_key_value(dep.as_str()) else {
                continue;
            };
            match marks.get(dep_key).copied().unwrap_or(Mark::Unvisited) {
                Mark::Unvisited => {
                    marks.insert(dep_key, Mark::OnStack);
                    frames.push((dep_key, 0));
                    path.push(dep_key);
                }
                Mark::OnStack => {
                    if let Some(start) = path.iter().position(|s| *s == dep_key) {
                        found.push(canonical_cycle(&path[start..]));
                    }
                }
                Mark::Done => {}
            }
        }
    }

    let mut seen = HashSet::new();
    found.retain(|cycle| seen.insert(cycle.clone()));
    found
}

/// Rotate a cycle so it starts at its smallest id, and close it.
fn canonical_cycle(path: &[&str]) -> Vec<String> {
    let start = path
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut cycle: Vec<String> = path[start..]
        .iter()
        .chain(path[..start].iter())
        .map(|s| s.to_string())
        .collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}

/// Tasks not reachable from any entry point by following dependents, in
/// declaration order.
pub fn find_orphans(graph: &TaskGraph) -> Vec<String> {
    let index = graph.index();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in &graph.tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = graph
        .roots()
        .into_iter()
        .filter(|id| index.contains_key(id))
        .collect();
    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        if let Some(next) = dependents.get(id) {
            queue.extend(next.iter().copied());
        }
    }

    graph
        .tasks
        .iter()
        .filter(|t| !reached.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect()
}

/// Dependencies and entry points naming undeclared tasks.
pub fn find_missing_dependencies(graph: &TaskGraph) -> Vec<MissingDependency> {
    let index = graph.index();
    let mut missing = Vec::new();
    for task in &graph.tasks {
        for dep in &task.depends_on {
            if !index.contains_key(dep.as_str()) {
                missing.push(MissingDependency {
                    referenced_by: task.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }
    for entry in &graph.entry_points {
        if !index.contains_key(entry.as_str()) {
            missing.push(MissingDependency {
                referenced_by: "entry_points".to_string(),
                missing: entry.clone(),
            });
        }
    }
    missing
}

/// Estimates outside `[benchmark / factor, benchmark * factor]` for their
/// category. Non-positive or non-finite estimates are always flagged; tasks
/// without an estimate or without a benchmarked category are not.
pub fn find_estimate_outliers(graph: &TaskGraph, policy: &EstimatePolicy) -> Vec<EstimateOutlier> {
    let mut outliers = Vec::new();
    for task in &graph.tasks {
        let Some(estimate) = task.estimate_hours else {
            continue;
        };
        if !estimate.is_finite() || estimate <= 0.0 {
            outliers.push(EstimateOutlier {
                task: task.id.clone(),
                category: task.category.clone(),
                estimate_hours: estimate,
                benchmark_hours: None,
                ratio: None,
            });
            continue;
        }
        let Some(benchmark) = task
            .category
            .as_ref()
            .and_then(|c| policy.benchmarks.get(c))
            .copied()
        else {
            continue;
        };
        let ratio = estimate / benchmark;
        if ratio > policy.tolerance_factor || ratio < 1.0 / policy.tolerance_factor {
            outliers.push(EstimateOutlier {
                task: task.id.clone(),
                category: task.category.clone(),
                estimate_hours: estimate,
                benchmark_hours: Some(benchmark),
                ratio: Some(ratio),
            });
        }
    }
    outliers
}

/// All four checks over one graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphReport {
    pub cycles: Vec<Vec<String>>,
    pub orphans: Vec<String>,
    pub missing_dependencies: Vec<MissingDependency>,
    pub estimate_outliers: Vec<EstimateOutlier>,
}

impl GraphReport {
    pub fn analyze(graph: &TaskGraph, policy: &EstimatePolicy) -> Self {
        Self {
            cycles: find_cycles(graph),
            orphans: find_orphans(graph),
            missing_dependencies: find_missing_dependencies(graph),
            estimate_outliers: find_estimate_outliers(graph, policy),
        }
    }

    /// Whether any structural problem prevents convergence.
    pub fn is_blocking(&self) -> bool {
        !self.cycles.is_empty() || !self.orphans.is_empty() || !self.missing_dependencies.is_empty()
    }

    pub fn blocking_findings(&self) -> Vec<String> {
        let mut findings = Vec::new();
        for cycle in &self.cycles {
            findings.push(format!("circular dependency: {}", cycle.join(" -> ")));
        }
        for orphan in &self.orphans {
            findings.push(format!("task '{}' is unreachable from the entry points", orphan));
        }
        for missing in &self.missing_dependencies {
            findings.push(format!(
                "'{}' references undeclared task '{}'",
                missing.referenced_by, missing.missing
            ));
        }
        findings
    }

    pub fn advisories(&self) -> Vec<String> {
        self.estimate_outliers
            .iter()
            .map(|o| match (o.benchmark_hours, o.ratio) {
                (Some(benchmark), Some(ratio)) => format!(
                    "task '{}' estimate {:.1}h is {:.1}x the {}h benchmark for '{}'",
                    o.task,
                    o.estimate_hours,
                    ratio,
                    benchmark,
                    o.category.as_deref().unwrap_or("")
                ),
                _ => format!("task '{}' has an invalid estimate ({})", o.task, o.estimate_hours),
            })
            .collect()
    }
}
