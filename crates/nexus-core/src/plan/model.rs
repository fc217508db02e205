use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard ceiling on a task's time estimate. Tasks above this must be split
/// before they can become ready.
pub const MAX_ESTIMATE_MINUTES: u32 = 30;

// ---------------------------------------------------------------------------
// Task identity
// ---------------------------------------------------------------------------

/// Hierarchical task identifier, e.g. `F001-A-03`.
///
/// Children produced by the splitter extend the parent id with a letter
/// suffix (`F001-A-03` -> `F001-A-03a`, `F001-A-03b`, ...), so lineage is
/// readable from the id alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the id of the `index`-th child (0-based): `a`..`z`, then
    /// `aa`, `ab`, ... for the unlikely case of more than 26 children.
    pub fn child(&self, index: usize) -> TaskId {
        let mut suffix = String::new();
        let mut n = index;
        loop {
            suffix.insert(0, (b'a' + (n % 26) as u8) as char);
            if n < 26 {
                break;
            }
            n = n / 26 - 1;
        }
        TaskId(format!("{}{suffix}", self.0))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    InQa,
    NeedsReview,
    Blocked,
    Escalated,
    Completed,
    Abandoned,
}

impl TaskStatus {
    /// Terminal statuses: the task will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }

    /// Suspended statuses: the task is waiting on a human or a replan.
    pub fn is_suspended(self) -> bool {
        matches!(self, Self::Blocked | Self::Escalated)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::InQa => "in_qa",
            Self::NeedsReview => "needs_review",
            Self::Blocked => "blocked",
            Self::Escalated => "escalated",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "in_qa" => Ok(Self::InQa),
            "needs_review" => Ok(Self::NeedsReview),
            "blocked" => Ok(Self::Blocked),
            "escalated" => Ok(Self::Escalated),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A task -- an atomic unit of work within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    /// Files the task is expected to touch.
    pub files: Vec<String>,
    /// Acceptance criterion the reviewer checks against.
    pub acceptance: String,
    pub depends_on: Vec<TaskId>,
    pub estimate_minutes: u32,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Open-ended per-task metadata (e.g. `"tdd": true`).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// A pending task with defaults for the optional fields.
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            files: Vec::new(),
            acceptance: String::new(),
            depends_on: Vec::new(),
            estimate_minutes: 10,
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            metadata: BTreeMap::new(),
        }
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

/// A plan -- a versioned, ordered set of tasks plus the dependency DAG
/// implied by each task's `depends_on` list.
///
/// Plans are mutated only by publishing a new version under the same id;
/// [`Plan::next_version`] clones the plan and bumps the version counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub version: u64,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            tasks,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.iter().any(|t| &t.id == id)
    }

    /// Clone with the version counter bumped; the starting point for a
    /// replan mutation batch.
    pub fn next_version(&self) -> Plan {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    /// Status of every task, keyed by id.
    pub fn statuses(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect()
    }

    /// Whether any task is still non-terminal.
    pub fn has_open_tasks(&self) -> bool {
        self.tasks.iter().any(|t| !t.status.is_terminal())
    }

    /// Ids of tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.depends_on.contains(id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of tasks that transitively depend on `id`.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![id.clone()];
        while let Some(current) = frontier.pop() {
            for dep in self.dependents_of(&current) {
                if seen.insert(dep.clone()) {
                    frontier.push(dep);
                }
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::InQa,
            TaskStatus::NeedsReview,
            TaskStatus::Blocked,
            TaskStatus::Escalated,
            TaskStatus::Completed,
            TaskStatus::Abandoned,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn priority_display_roundtrip() {
        for v in &[Priority::Low, Priority::Normal, Priority::High] {
            let parsed: Priority = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn terminal_and_suspended_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Abandoned.is_terminal());
        assert!(!TaskStatus::Escalated.is_terminal());
        assert!(TaskStatus::Escalated.is_suspended());
        assert!(TaskStatus::Blocked.is_suspended());
        assert!(!TaskStatus::Running.is_suspended());
    }

    #[test]
    fn child_ids_extend_the_parent() {
        let parent = TaskId::new("F001-A-03");
        assert_eq!(parent.child(0).as_str(), "F001-A-03a");
        assert_eq!(parent.child(1).as_str(), "F001-A-03b");
        assert_eq!(parent.child(25).as_str(), "F001-A-03z");
        assert_eq!(parent.child(26).as_str(), "F001-A-03aa");
        assert_eq!(parent.child(27).as_str(), "F001-A-03ab");
    }

    #[test]
    fn transitive_dependents_walk_the_graph() {
        let mut a = Task::new("a", "a");
        let mut b = Task::new("b", "b");
        b.depends_on = vec![a.id.clone()];
        let mut c = Task::new("c", "c");
        c.depends_on = vec![b.id.clone()];
        let d = Task::new("d", "d");
        a.status = TaskStatus::Completed;

        let plan = Plan::new("p", vec![a, b, c, d]);
        let deps = plan.transitive_dependents(&TaskId::new("a"));
        assert_eq!(
            deps.into_iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[test]
    fn next_version_bumps_and_preserves_identity() {
        let plan = Plan::new("p", vec![Task::new("t1", "one")]);
        let next = plan.next_version();
        assert_eq!(next.id, plan.id);
        assert_eq!(next.version, plan.version + 1);
    }
}
