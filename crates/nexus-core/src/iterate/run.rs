//! Per-attempt bookkeeping for the iterator.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::host::WorktreeHandle;
use crate::plan::{Task, TaskId};
use crate::replan::signal::RunMetrics;

use super::stage::{Diagnostic, Fingerprint, Stage, StageResult, file_set_hash};

/// One stage execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub iteration: u32,
    pub stage: Stage,
    pub result: StageResult,
}

/// One attempt by the iterator on a task.
///
/// Owned exclusively by the iterator while it exists; sealed on the
/// terminal stage outcome and then handed to the coordinator (and, on
/// escalation, into the escalation package).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    /// Number of coding passes so far (1-based once started).
    pub iterations: u32,
    pub stage_history: Vec<StageRecord>,
    pub worktree: Option<WorktreeHandle>,
    /// Union of files the agent declared touching across all iterations.
    pub touched_files: BTreeSet<String>,
    /// Hash of the touched-file set after the latest coding pass.
    pub files_hash: Option<String>,
    /// Occurrences per diagnostic fingerprint.
    pub fingerprint_counts: BTreeMap<Fingerprint, u32>,
    /// Back-to-back failures of the same stage.
    pub consecutive_failures: u32,
    pub failing_stage: Option<Stage>,
    pub reroutes: u32,
    pub reroute_hints: Vec<String>,
    pub replan_requested: bool,
    pub review_scope_too_large: bool,
    pub sealed_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(task_id: TaskId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            started_at,
            iterations: 0,
            stage_history: Vec::new(),
            worktree: None,
            touched_files: BTreeSet::new(),
            files_hash: None,
            fingerprint_counts: BTreeMap::new(),
            consecutive_failures: 0,
            failing_stage: None,
            reroutes: 0,
            reroute_hints: Vec::new(),
            replan_requested: false,
            review_scope_too_large: false,
            sealed_at: None,
        }
    }

    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.started_at).num_milliseconds() as f64 / 60_000.0
    }

    /// Record the agent's declared file set for this iteration.
    ///
    /// Returns `true` when the hash changed, i.e. previously green stages
    /// must rerun from the build.
    pub fn record_touched(&mut self, files: &[String]) -> bool {
        self.touched_files.extend(files.iter().cloned());
        let all: Vec<String> = self.touched_files.iter().cloned().collect();
        let hash = file_set_hash(&all);
        let changed = self.files_hash.as_deref() != Some(hash.as_str());
        self.files_hash = Some(hash);
        changed
    }

    /// Record a stage outcome, maintaining fingerprint counts and the
    /// consecutive-failure counter.
    pub fn record_stage(&mut self, stage: Stage, result: StageResult) {
        if result.passed {
            if self.failing_stage == Some(stage) {
                self.failing_stage = None;
                self.consecutive_failures = 0;
            }
        } else {
            for diagnostic in &result.diagnostics {
                let fp = Fingerprint::new(stage.as_str(), diagnostic);
                *self.fingerprint_counts.entry(fp).or_insert(0) += 1;
            }
            if self.failing_stage == Some(stage) {
                self.consecutive_failures += 1;
            } else {
                self.failing_stage = Some(stage);
                self.consecutive_failures = 1;
            }
        }

        self.stage_history.push(StageRecord {
            iteration: self.iterations,
            stage,
            result,
        });
    }

    /// Record a failure outside the QA stages (agent misbehavior), under
    /// the given fingerprint label.
    pub fn record_misbehavior(&mut self, diagnostic: &Diagnostic) {
        let fp = Fingerprint::new("agent", diagnostic);
        *self.fingerprint_counts.entry(fp).or_insert(0) += 1;
    }

    /// The most recent diagnostics, newest last, capped at `limit`.
    pub fn last_diagnostics(&self, limit: usize) -> Vec<Diagnostic> {
        let mut diagnostics: Vec<Diagnostic> = self
            .stage_history
            .iter()
            .flat_map(|record| record.result.diagnostics.iter().cloned())
            .collect();
        let len = diagnostics.len();
        diagnostics.split_off(len.saturating_sub(limit))
    }

    /// Snapshot the run's vital signs for the replanner.
    pub fn metrics(&self, task: &Task, now: DateTime<Utc>) -> RunMetrics {
        RunMetrics {
            task_id: self.task_id.clone(),
            iterations: self.iterations,
            elapsed_minutes: self.elapsed_minutes(now),
            declared_files: task.files.clone(),
            touched_files: self.touched_files.iter().cloned().collect(),
            fingerprint_counts: self.fingerprint_counts.clone(),
            consecutive_same_stage_failures: self.consecutive_failures,
            failing_stage: self.failing_stage,
            reroutes: self.reroutes,
            replan_requested: self.replan_requested,
            review_scope_too_large: self.review_scope_too_large,
        }
    }

    pub fn seal(&mut self, now: DateTime<Utc>) {
        self.sealed_at = Some(now);
    }
}
