//! Worktree isolation seam.
//!
//! Each concurrently running task owns one isolated worktree; two
//! iterators never write the same file on the same branch. The provider
//! enforces that guarantee -- the core assumes it.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plan::TaskId;

/// Handle to an acquired worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeHandle {
    pub task_id: TaskId,
    /// Filesystem path of the worktree.
    pub path: PathBuf,
    /// Branch the task's work lands on.
    pub branch: String,
}

/// Result of merging a task branch into the base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged {
        /// Commit id of the merge on the base branch.
        commit: String,
    },
    Conflicts {
        /// Human-readable conflict report (attached to escalations).
        report: String,
    },
}

/// Git worktree operations the core depends on.
#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    /// Acquire an isolated worktree for a task.
    async fn acquire(&self, task_id: &TaskId) -> Result<WorktreeHandle>;

    /// Release a worktree once the task reaches a terminal state.
    async fn release(&self, handle: WorktreeHandle) -> Result<()>;

    /// Merge the task branch into the latest base.
    async fn merge(&self, handle: &WorktreeHandle) -> Result<MergeOutcome>;

    /// Record a named checkpoint ref (e.g. an escalation tag); returns the
    /// created git ref.
    async fn checkpoint(&self, tag: &str) -> Result<String>;
}

// Compile-time assertion: WorktreeProvider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn WorktreeProvider) {}
};
