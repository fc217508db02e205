//! Escalation: freeze a failing task, snapshot state, and bring a human
//! into the loop.

pub mod report;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::host::{Clock, HumanChannel, HumanDecision, PersistenceGateway, WorktreeProvider};
use crate::iterate::run::TaskRun;
use crate::plan::{Plan, Task, TaskId};
use crate::replan::DecisionRecord;

/// Why a task was escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalateReason {
    IterationCap { iterations: u32 },
    WallClockCap { elapsed_minutes: f64 },
    RepeatedFailure { fingerprint: String },
    ReviewRejected { summary: String },
    MergeConflict { report: String },
    ToolFailure { detail: String },
    ReplanRejected { detail: String },
    /// The replanner decided the task is beyond automatic correction.
    ReplanEscalation { rationale: String },
}

impl fmt::Display for EscalateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IterationCap { iterations } => {
                write!(f, "iteration cap reached ({iterations} iterations)")
            }
            Self::WallClockCap { elapsed_minutes } => {
                write!(f, "wall-clock cap reached ({elapsed_minutes:.1} min)")
            }
            Self::RepeatedFailure { fingerprint } => {
                write!(f, "same diagnostic kept recurring (fingerprint {fingerprint})")
            }
            Self::ReviewRejected { summary } => write!(f, "review rejected the change: {summary}"),
            Self::MergeConflict { .. } => f.write_str("merge conflicted twice"),
            Self::ToolFailure { detail } => write!(f, "tooling failed repeatedly: {detail}"),
            Self::ReplanRejected { detail } => {
                write!(f, "replan decision was rejected: {detail}")
            }
            Self::ReplanEscalation { rationale } => {
                write!(f, "replanner escalated: {rationale}")
            }
        }
    }
}

/// The artifact a human reviews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPackage {
    pub id: Uuid,
    pub task: Task,
    pub run_history: Vec<TaskRun>,
    pub checkpoint_id: Uuid,
    /// Git ref of the escalation tag.
    pub git_ref: String,
    /// Markdown report for the human.
    pub report: String,
    pub notification_channels: Vec<String>,
    pub reason: EscalateReason,
    pub created_at: DateTime<Utc>,
}

/// Escalation failures.
#[derive(Debug, Error)]
pub enum EscalateError {
    #[error("failed to record escalation checkpoint for {task}: {cause}")]
    CheckpointFailed { task: TaskId, cause: anyhow::Error },

    #[error("no open escalation package {0}")]
    UnknownPackage(Uuid),

    #[error("human channel failed: {0}")]
    ChannelFailed(anyhow::Error),
}

/// Freezes failing tasks and shepherds them through a human decision.
///
/// Holds at most one open package per task id; escalating an
/// already-escalated task merges the new run and reason into the open
/// package instead of opening a second one.
pub struct EscalationHandler {
    worktrees: Arc<dyn WorktreeProvider>,
    persistence: Arc<dyn PersistenceGateway>,
    human: Arc<dyn HumanChannel>,
    clock: Arc<dyn Clock>,
    notification_channels: Vec<String>,
    open: Mutex<HashMap<TaskId, EscalationPackage>>,
}

impl EscalationHandler {
    pub fn new(
        worktrees: Arc<dyn WorktreeProvider>,
        persistence: Arc<dyn PersistenceGateway>,
        human: Arc<dyn HumanChannel>,
        clock: Arc<dyn Clock>,
        notification_channels: Vec<String>,
    ) -> Self {
        Self {
            worktrees,
            persistence,
            human,
            clock,
            notification_channels,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Freeze a task: checkpoint, report, notify.
    ///
    /// Returns the open package -- freshly created, or the existing one
    /// with the new run and reason merged in.
    pub async fn escalate(
        &self,
        task: &Task,
        run: TaskRun,
        reason: EscalateReason,
        plan: &Plan,
        decisions: &[&DecisionRecord],
    ) -> Result<EscalationPackage, EscalateError> {
        let mut open = self.open.lock().await;

        if let Some(existing) = open.get_mut(&task.id) {
            tracing::info!(
                task_id = %task.id,
                package_id = %existing.id,
                "merging context into open escalation"
            );
            existing.run_history.push(run);
            existing.reason = reason;
            existing.report = report::render_report(
                task,
                &existing.run_history,
                &existing.reason,
                decisions,
                &existing.git_ref,
            );
            let package = existing.clone();
            drop(open);
            self.notify(&package).await;
            return Ok(package);
        }

        let now = self.clock.now();
        let tag = format!(
            "nexus/escalate/{}/{}",
            task.id,
            now.format("%Y%m%dT%H%M%SZ")
        );
        let git_ref = self
            .worktrees
            .checkpoint(&tag)
            .await
            .map_err(|cause| EscalateError::CheckpointFailed {
                task: task.id.clone(),
                cause,
            })?;

        let mut checkpoint = Checkpoint::capture(plan, now);
        checkpoint.git_refs.push(git_ref.clone());
        self.persistence
            .write_checkpoint(&checkpoint)
            .await
            .map_err(|cause| EscalateError::CheckpointFailed {
                task: task.id.clone(),
                cause,
            })?;

        let runs = vec![run];
        let package = EscalationPackage {
            id: Uuid::new_v4(),
            task: task.clone(),
            report: report::render_report(task, &runs, &reason, decisions, &git_ref),
            run_history: runs,
            checkpoint_id: checkpoint.id,
            git_ref,
            notification_channels: self.notification_channels.clone(),
            reason,
            created_at: now,
        };

        tracing::warn!(
            task_id = %task.id,
            package_id = %package.id,
            reason = %package.reason,
            "task escalated"
        );
        open.insert(task.id.clone(), package.clone());
        drop(open);

        self.notify(&package).await;
        Ok(package)
    }

    /// Block until the human decides. No timeout: humans set the pace.
    pub async fn await_decision(&self, package_id: Uuid) -> Result<HumanDecision, EscalateError> {
        // The package must be open.
        {
            let open = self.open.lock().await;
            if !open.values().any(|p| p.id == package_id) {
                return Err(EscalateError::UnknownPackage(package_id));
            }
        }
        self.human
            .await_decision(package_id)
            .await
            .map_err(EscalateError::ChannelFailed)
    }

    /// Close the package and hand the decision back to the coordinator.
    pub async fn resume(
        &self,
        package_id: Uuid,
        decision: HumanDecision,
    ) -> Result<(TaskId, HumanDecision), EscalateError> {
        let mut open = self.open.lock().await;
        let task_id = open
            .iter()
            .find(|(_, p)| p.id == package_id)
            .map(|(id, _)| id.clone())
            .ok_or(EscalateError::UnknownPackage(package_id))?;
        open.remove(&task_id);
        tracing::info!(
            task_id = %task_id,
            package_id = %package_id,
            decision = ?decision,
            "escalation resolved"
        );
        Ok((task_id, decision))
    }

    /// The open package for a task, if any.
    pub async fn open_package(&self, task_id: &TaskId) -> Option<EscalationPackage> {
        self.open.lock().await.get(task_id).cloned()
    }

    /// Number of open packages.
    pub async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }

    async fn notify(&self, package: &EscalationPackage) {
        if let Err(e) = self.human.notify(package).await {
            // Notification failure must not lose the escalation; the
            // package stays open and pollable.
            tracing::error!(
                package_id = %package.id,
                error = %e,
                "failed to notify human channel"
            );
        }
    }
}
