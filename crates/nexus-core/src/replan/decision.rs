//! Replan decisions and the plan mutations they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{Task, TaskId};
use crate::split::SplitStrategy;

use super::signal::ReplanSignal;

/// The corrective action a decision commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanAction {
    Split(SplitStrategy),
    ReEstimate,
    Reroute,
    Escalate,
}

impl std::fmt::Display for ReplanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split(strategy) => write!(f, "split({strategy})"),
            Self::ReEstimate => f.write_str("re_estimate"),
            Self::Reroute => f.write_str("reroute"),
            Self::Escalate => f.write_str("escalate"),
        }
    }
}

/// A structural plan edit. Applied as a batch; the batch is atomic at the
/// plan-version level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMutation {
    AddTask(Task),
    RemoveTask(TaskId),
    SetDependsOn { task: TaskId, depends_on: Vec<TaskId> },
    SetEstimate { task: TaskId, minutes: u32 },
}

/// What the replanner decided for one task in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanDecision {
    pub task_id: TaskId,
    pub action: ReplanAction,
    pub rationale: String,
    pub mutations: Vec<PlanMutation>,
    /// The signals that led here; kept for the escalation report.
    pub signals: Vec<ReplanSignal>,
}

/// One decision as recorded in the replanner's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,
    pub decision: ReplanDecision,
    /// Whether the mutations were applied, or the decision was rejected
    /// and downgraded to an escalation.
    pub applied: bool,
    /// Plan version the decision produced (when applied).
    pub plan_version: Option<u64>,
}
