//! The agent seam: one coding step per call.
//!
//! The iterator drives an [`AgentRunner`] with the task description, the
//! accumulated diagnostics, and the open tool set. Streaming hosts buffer
//! internally -- the core requires only the final step result, which keeps
//! the scheduler single-threaded and testable.

use async_trait::async_trait;
use thiserror::Error;

use super::worktree::WorktreeHandle;
use crate::iterate::stage::Diagnostic;
use crate::plan::Task;

/// Tools exposed to the agent on every step.
pub const AGENT_TOOLS: &[&str] = &[
    "read-file",
    "write-file",
    "run-command",
    "request-context",
    "request-replan",
];

/// Context assembled by the iterator for one agent step.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    /// Current iteration number (1-based).
    pub iteration: u32,
    /// Diagnostics from the failed stage the agent must fix, if any.
    pub diagnostics: Vec<Diagnostic>,
    /// Extra context fetched through `request-context` on this iteration.
    pub extra_context: Vec<String>,
    /// Hints accumulated from reroute decisions ("try a different
    /// approach").
    pub reroute_hints: Vec<String>,
    /// Set on a corrective retry after the agent misbehaved.
    pub strict: bool,
}

/// What the agent reports after one step.
#[derive(Debug, Clone, Default)]
pub struct AgentStepResult {
    /// Files the agent declares it touched.
    pub files_touched: Vec<String>,
    /// The agent wants more context before it can proceed; the step is
    /// re-run with the answer appended, within the same iteration.
    pub requested_context: Option<String>,
    /// The agent judges the task larger than its description; the task
    /// suspends until the replanner has had a look.
    pub requested_replan: bool,
    /// Free-form summary of what the step did.
    pub summary: String,
}

/// How an agent step failed.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Infrastructure failure (network, spawn). Retried with backoff.
    #[error("transient agent failure: {0}")]
    Transient(String),

    /// The agent produced an invalid response (malformed output, illegal
    /// tool use). One corrective retry with a stricter prompt.
    #[error("agent misbehaved: {0}")]
    Misbehavior(String),
}

/// Runs one agent step. Agent construction and pooling are the host's
/// responsibility; the core only ever sees this capability.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_agent(
        &self,
        task: &Task,
        context: &AgentContext,
        tools: &[&str],
        worktree: &WorktreeHandle,
    ) -> Result<AgentStepResult, RunnerError>;
}

/// Serves `request-context` tool calls. In Evolution mode the host scopes
/// this to the affected area of the codebase.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn provide(&self, task: &Task, query: &str) -> anyhow::Result<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner, _: &dyn ContextProvider) {}
};
