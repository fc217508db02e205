//! Replan signals and the run metrics they are evaluated against.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::iterate::stage::{Fingerprint, Stage};
use crate::plan::TaskId;
use crate::split::SplitStrategy;

/// The threshold a running task crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    TimeExceeded,
    IterationExceeded,
    ScopeCreep,
    RepeatedFailure,
    UnexpectedComplexity,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TimeExceeded => "time_exceeded",
            Self::IterationExceeded => "iteration_exceeded",
            Self::ScopeCreep => "scope_creep",
            Self::RepeatedFailure => "repeated_failure",
            Self::UnexpectedComplexity => "unexpected_complexity",
        };
        f.write_str(s)
    }
}

/// What a trigger evaluator suggests the replanner do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Split(SplitStrategy),
    ReEstimate,
    Reroute,
    Escalate,
}

/// Observation that a running task crossed a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanSignal {
    pub kind: SignalKind,
    pub task_id: TaskId,
    /// The observed metric, rendered for the decision record.
    pub observed: String,
    /// The threshold it crossed, rendered for the decision record.
    pub threshold: String,
    pub suggested: SuggestedAction,
}

/// Snapshot of a task run's vital signs, published by the iterator after
/// every stage transition and sampled on the replanner tick.
///
/// This is the only view of a run the replanner ever sees; the run itself
/// stays owned by the iterator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub task_id: TaskId,
    pub iterations: u32,
    pub elapsed_minutes: f64,
    /// Files the task declared it would touch.
    pub declared_files: Vec<String>,
    /// Files the agent has actually touched so far.
    pub touched_files: Vec<String>,
    /// Occurrence count per diagnostic fingerprint.
    pub fingerprint_counts: BTreeMap<Fingerprint, u32>,
    /// How many times the same stage has failed back-to-back.
    pub consecutive_same_stage_failures: u32,
    /// The stage those consecutive failures happened in.
    pub failing_stage: Option<Stage>,
    /// Reroutes already applied to this run.
    pub reroutes: u32,
    /// The agent asked for a replan via the `request-replan` tool.
    pub replan_requested: bool,
    /// The reviewer reported the change is too large for one task.
    pub review_scope_too_large: bool,
}

impl RunMetrics {
    /// Files touched beyond the declared set.
    pub fn undeclared_files(&self) -> Vec<&str> {
        self.touched_files
            .iter()
            .filter(|f| !self.declared_files.contains(f))
            .map(String::as_str)
            .collect()
    }

    /// The most frequent diagnostic fingerprint, if any.
    pub fn hottest_fingerprint(&self) -> Option<(&Fingerprint, u32)> {
        self.fingerprint_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(fp, count)| (fp, *count))
    }
}
