//! Task splitting: break an oversized task into smaller atomic tasks.
//!
//! The splitter is pure plan surgery -- it produces child tasks but never
//! touches the plan itself; the replanner folds the children into a new
//! plan version via mutations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::{MAX_ESTIMATE_MINUTES, Task, TaskId, TaskStatus};

/// How to carve a parent task into children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// One child per declared file.
    ByFile,
    /// One child per independently testable segment of the acceptance
    /// criterion.
    ByFunctionality,
    /// Halve recursively until every child estimate fits the budget.
    ByTime,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ByFile => "by_file",
            Self::ByFunctionality => "by_functionality",
            Self::ByTime => "by_time",
        };
        f.write_str(s)
    }
}

impl FromStr for SplitStrategy {
    type Err = SplitStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "by_file" => Ok(Self::ByFile),
            "by_functionality" => Ok(Self::ByFunctionality),
            "by_time" => Ok(Self::ByTime),
            other => Err(SplitStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SplitStrategy`] string.
#[derive(Debug, Clone)]
pub struct SplitStrategyParseError(pub String);

impl fmt::Display for SplitStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid split strategy: {:?}", self.0)
    }
}

impl std::error::Error for SplitStrategyParseError {}

/// Errors a split attempt can surface. All are recoverable; the caller
/// picks another action.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("splitting {task} with {strategy} would not produce at least two children")]
    SplitNotProductive { task: TaskId, strategy: SplitStrategy },

    #[error("strategy {strategy} is not applicable to {task}: {reason}")]
    StrategyNotApplicable {
        task: TaskId,
        strategy: SplitStrategy,
        reason: String,
    },

    #[error("cannot split {task} by time: budget of {budget} min is unreachable")]
    BudgetUnreachable { task: TaskId, budget: u32 },
}

/// Splitter configuration.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Target estimate for ByTime children. Hard cap stays at
    /// [`MAX_ESTIMATE_MINUTES`] regardless.
    pub time_budget_minutes: u32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            time_budget_minutes: 15,
        }
    }
}

/// Breaks oversized tasks into smaller atomic tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskSplitter {
    config: SplitConfig,
}

impl TaskSplitter {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// Split `task` with `strategy`, producing >= 2 children whose union of
    /// files and acceptance criteria covers the parent.
    ///
    /// Child ids extend the parent id in stable left-to-right order, and
    /// children inherit the parent's dependencies. ByFile and ByTime
    /// children additionally serialize against each other with linear
    /// `depends_on` edges; ByFunctionality children stay independent.
    pub fn split(&self, task: &Task, strategy: SplitStrategy) -> Result<Vec<Task>, SplitError> {
        let children = match strategy {
            SplitStrategy::ByFile => self.split_by_file(task)?,
            SplitStrategy::ByFunctionality => self.split_by_functionality(task)?,
            SplitStrategy::ByTime => self.split_by_time(task)?,
        };

        debug_assert!(children.len() >= 2);
        self.audit_estimates(task, &children);
        Ok(children)
    }

    fn split_by_file(&self, task: &Task) -> Result<Vec<Task>, SplitError> {
        if task.files.is_empty() {
            return Err(SplitError::StrategyNotApplicable {
                task: task.id.clone(),
                strategy: SplitStrategy::ByFile,
                reason: "task declares no files".to_owned(),
            });
        }
        if task.files.len() < 2 {
            return Err(SplitError::SplitNotProductive {
                task: task.id.clone(),
                strategy: SplitStrategy::ByFile,
            });
        }

        let per_child = split_estimate(task.estimate_minutes, task.files.len());
        let children = task
            .files
            .iter()
            .enumerate()
            .map(|(i, file)| {
                let mut child = child_skeleton(task, i, per_child[i]);
                child.name = format!("{} ({file})", task.name);
                child.files = vec![file.clone()];
                child.acceptance = format!("{} (scoped to {file})", task.acceptance);
                child
            })
            .collect();

        Ok(chain_siblings(children))
    }

    fn split_by_functionality(&self, task: &Task) -> Result<Vec<Task>, SplitError> {
        if task.acceptance.trim().is_empty() {
            return Err(SplitError::StrategyNotApplicable {
                task: task.id.clone(),
                strategy: SplitStrategy::ByFunctionality,
                reason: "task has no acceptance criterion".to_owned(),
            });
        }

        let segments = segment_acceptance(&task.acceptance);
        if segments.len() < 2 {
            return Err(SplitError::SplitNotProductive {
                task: task.id.clone(),
                strategy: SplitStrategy::ByFunctionality,
            });
        }

        let per_child = split_estimate(task.estimate_minutes, segments.len());
        let children = segments
            .iter()
            .enumerate()
            .map(|(i, goal)| {
                let mut child = child_skeleton(task, i, per_child[i]);
                child.name = format!("{} [{}/{}]", task.name, i + 1, segments.len());
                child.acceptance = goal.clone();
                child
            })
            .collect();

        Ok(children)
    }

    fn split_by_time(&self, task: &Task) -> Result<Vec<Task>, SplitError> {
        let budget = self
            .config
            .time_budget_minutes
            .min(MAX_ESTIMATE_MINUTES);
        if budget == 0 {
            return Err(SplitError::BudgetUnreachable {
                task: task.id.clone(),
                budget,
            });
        }
        if task.estimate_minutes <= budget {
            return Err(SplitError::SplitNotProductive {
                task: task.id.clone(),
                strategy: SplitStrategy::ByTime,
            });
        }

        // Halve recursively until every slice fits the budget.
        let mut slices = vec![task.estimate_minutes];
        while slices.iter().any(|m| *m > budget) {
            if slices.iter().any(|m| *m <= 1) {
                // Halving again would mint sub-minute tasks.
                return Err(SplitError::BudgetUnreachable {
                    task: task.id.clone(),
                    budget,
                });
            }
            slices = slices
                .into_iter()
                .flat_map(|m| {
                    let first = m.div_ceil(2);
                    [first, m - first]
                })
                .collect();
        }

        let children = slices
            .iter()
            .enumerate()
            .map(|(i, minutes)| {
                let mut child = child_skeleton(task, i, (*minutes).max(1));
                child.name = format!("{} (part {}/{})", task.name, i + 1, slices.len());
                child.acceptance = format!("{} (part {} of {})", task.acceptance, i + 1, slices.len());
                child
            })
            .collect();

        Ok(chain_siblings(children))
    }

    /// Check the children's total estimate against the +-30% corridor
    /// around the parent's; outside it, log and carry on with the sum.
    fn audit_estimates(&self, task: &Task, children: &[Task]) {
        let total: u32 = children.iter().map(|c| c.estimate_minutes).sum();
        let lo = (f64::from(task.estimate_minutes) * 0.7).floor() as u32;
        let hi = (f64::from(task.estimate_minutes) * 1.3).ceil() as u32;
        if total < lo || total > hi {
            tracing::warn!(
                task_id = %task.id,
                parent_estimate = task.estimate_minutes,
                children_total = total,
                "child estimates drift outside 30% of the parent; adopting the sum"
            );
        }
    }
}

/// Common child fields: id suffix, inherited dependencies and metadata,
/// pending status.
fn child_skeleton(parent: &Task, index: usize, estimate_minutes: u32) -> Task {
    Task {
        id: parent.id.child(index),
        name: parent.name.clone(),
        description: parent.description.clone(),
        files: parent.files.clone(),
        acceptance: parent.acceptance.clone(),
        depends_on: parent.depends_on.clone(),
        estimate_minutes,
        priority: parent.priority,
        status: TaskStatus::Pending,
        metadata: parent.metadata.clone(),
    }
}

/// Add linear sibling edges: child[i] depends on child[i-1].
fn chain_siblings(mut children: Vec<Task>) -> Vec<Task> {
    for i in 1..children.len() {
        let prev = children[i - 1].id.clone();
        children[i].depends_on.push(prev);
    }
    children
}

/// Divide `total` minutes across `n` children, each at least one minute,
/// remainder spread over the leading children.
fn split_estimate(total: u32, n: usize) -> Vec<u32> {
    let n_u32 = n as u32;
    let base = (total / n_u32).max(1);
    let mut remainder = if base * n_u32 >= total {
        0
    } else {
        total - base * n_u32
    };
    (0..n)
        .map(|_| {
            if remainder > 0 {
                remainder -= 1;
                base + 1
            } else {
                base
            }
        })
        .collect()
}

/// Segment an acceptance criterion into independently testable sub-goals:
/// split on newlines and semicolons, trim list markers.
fn segment_acceptance(acceptance: &str) -> Vec<String> {
    acceptance
        .split(['\n', ';'])
        .map(|s| s.trim().trim_start_matches(['-', '*']).trim())
        .map(|s| s.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')').trim())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
