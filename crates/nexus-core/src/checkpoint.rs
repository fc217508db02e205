//! Checkpoints: serializable snapshots of plan + statuses + git refs.
//!
//! Written at wave boundaries and on escalation. A checkpoint owns no
//! references to agents; on resume, agents are re-bound and any task the
//! cursor names is re-run from scratch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::{Plan, TaskId, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Full snapshot of the plan version at checkpoint time.
    pub plan: Plan,
    /// Task statuses keyed by id, snapshotted alongside the plan.
    pub task_statuses: BTreeMap<TaskId, TaskStatus>,
    /// Git refs recorded by the worktree provider (escalation tags,
    /// merge commits).
    pub git_refs: Vec<String>,
    /// Tasks of the in-flight wave that had not settled when the
    /// checkpoint was taken; re-run from scratch on resume.
    pub iterator_cursor: Option<Vec<TaskId>>,
}

impl Checkpoint {
    pub fn capture(plan: &Plan, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            plan: plan.clone(),
            task_statuses: plan.statuses(),
            git_refs: Vec::new(),
            iterator_cursor: None,
        }
    }

    /// Rebuild the plan this checkpoint snapshotted, with the recorded
    /// statuses applied.
    pub fn restore_plan(&self) -> Plan {
        let mut plan = self.plan.clone();
        for task in &mut plan.tasks {
            if let Some(status) = self.task_statuses.get(&task.id) {
                task.status = *status;
            }
        }
        // Tasks that were mid-flight resume from the queue, not mid-run.
        if let Some(cursor) = &self.iterator_cursor {
            for id in cursor {
                if let Some(task) = plan.task_mut(id) {
                    if !task.status.is_terminal() {
                        task.status = TaskStatus::Ready;
                    }
                }
            }
        }
        plan
    }
}
