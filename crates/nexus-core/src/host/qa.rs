//! The QA seam: build/lint/test/review callbacks supplied by the host.
//!
//! Every callback is optional -- a stage whose callback returns `None`
//! counts as an automatic pass. Errors are treated as transient tool
//! failures and retried by the iterator.

use anyhow::Result;
use async_trait::async_trait;

use super::worktree::WorktreeHandle;
use crate::iterate::stage::{ReviewOutcome, StageResult};
use crate::plan::Task;

/// Runs the host's toolchain against a task's worktree.
#[async_trait]
pub trait QaRunner: Send + Sync {
    /// Compile/build the worktree. `None` = no build step configured.
    async fn build(&self, task: &Task, worktree: &WorktreeHandle) -> Result<Option<StageResult>>;

    /// Lint the worktree. `None` = no lint step configured.
    async fn lint(&self, task: &Task, worktree: &WorktreeHandle) -> Result<Option<StageResult>>;

    /// Run the test suite. `None` = no test step configured.
    async fn test(&self, task: &Task, worktree: &WorktreeHandle) -> Result<Option<StageResult>>;

    /// Review the change against the task's acceptance criterion.
    /// `None` = no reviewer configured.
    async fn review(&self, task: &Task, worktree: &WorktreeHandle)
    -> Result<Option<ReviewOutcome>>;
}

/// A QA runner with no callbacks: every stage auto-passes. Useful for
/// dry runs and as a base for hosts that only wire some stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQa;

#[async_trait]
impl QaRunner for NoopQa {
    async fn build(&self, _: &Task, _: &WorktreeHandle) -> Result<Option<StageResult>> {
        Ok(None)
    }

    async fn lint(&self, _: &Task, _: &WorktreeHandle) -> Result<Option<StageResult>> {
        Ok(None)
    }

    async fn test(&self, _: &Task, _: &WorktreeHandle) -> Result<Option<StageResult>> {
        Ok(None)
    }

    async fn review(&self, _: &Task, _: &WorktreeHandle) -> Result<Option<ReviewOutcome>> {
        Ok(None)
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn QaRunner) {}
};
