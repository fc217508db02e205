//! Dynamic replanning: observe running tasks, fire triggers, decide on
//! corrective actions, and publish new plan versions.
//!
//! The replanner holds read access to plan and run metrics; its writes
//! reach the plan only through [`ReplanDecision`]s the coordinator asks it
//! to apply. Mutation batches are atomic at the plan-version level: a
//! batch that would break the DAG or the 30-minute invariant is rejected
//! whole, and the caller escalates the task instead.

pub mod decision;
pub mod signal;
pub mod triggers;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::host::TimeEstimator;
use crate::plan::{Plan, Task, TaskId, validate_plan};
use crate::split::{SplitStrategy, TaskSplitter};

pub use decision::{DecisionRecord, PlanMutation, ReplanAction, ReplanDecision};
pub use signal::{ReplanSignal, RunMetrics, SignalKind, SuggestedAction};
pub use triggers::TriggerConfig;

/// Why a decision could not be applied.
#[derive(Debug, Error)]
pub enum ReplanError {
    #[error("decision for {task} rejected: {reason}")]
    DecisionRejected { task: TaskId, reason: String },
}

/// Replanner policy knobs.
#[derive(Debug, Clone)]
pub struct ReplannerConfig {
    pub triggers: TriggerConfig,
    /// Hard ceiling on reroutes per task; the next repeated failure
    /// escalates.
    pub max_reroutes: u32,
}

impl Default for ReplannerConfig {
    fn default() -> Self {
        Self {
            triggers: TriggerConfig::default(),
            max_reroutes: 2,
        }
    }
}

/// A signal queued for the next decision cycle, with the metrics that
/// produced it.
struct PendingSignal {
    signal: ReplanSignal,
    metrics: RunMetrics,
}

/// Observes the live task graph and picks corrective actions.
pub struct DynamicReplanner {
    config: ReplannerConfig,
    splitter: TaskSplitter,
    estimator: Arc<dyn TimeEstimator>,
    /// At most one pending signal per task per cycle; first match wins.
    pending: BTreeMap<TaskId, PendingSignal>,
    /// Reroutes granted so far, per task.
    reroutes: BTreeMap<TaskId, u32>,
    /// Fingerprint count already acted on, per task; RepeatedFailure
    /// re-arms only after another full burst.
    repeat_acted: BTreeMap<TaskId, u32>,
    history: Vec<DecisionRecord>,
}

impl DynamicReplanner {
    pub fn new(
        config: ReplannerConfig,
        splitter: TaskSplitter,
        estimator: Arc<dyn TimeEstimator>,
    ) -> Self {
        Self {
            config,
            splitter,
            estimator,
            pending: BTreeMap::new(),
            reroutes: BTreeMap::new(),
            repeat_acted: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Record the latest metrics for a task and enqueue the first-matching
    /// trigger signal, if any.
    pub fn observe(&mut self, task: &Task, metrics: &RunMetrics) {
        if self.pending.contains_key(&task.id) {
            return;
        }
        let Some(signal) = triggers::evaluate_all(task, metrics, &self.config.triggers) else {
            return;
        };

        // RepeatedFailure re-arms per burst: act at 3, then again at 6.
        if signal.kind == SignalKind::RepeatedFailure {
            let count = metrics.hottest_fingerprint().map_or(0, |(_, c)| c);
            let acted = self.repeat_acted.get(&task.id).copied().unwrap_or(0);
            if count < acted + self.config.triggers.repeat_threshold {
                return;
            }
            self.repeat_acted.insert(task.id.clone(), count);
        }

        tracing::debug!(
            task_id = %task.id,
            kind = %signal.kind,
            observed = %signal.observed,
            "replan signal enqueued"
        );
        self.pending.insert(
            task.id.clone(),
            PendingSignal {
                signal,
                metrics: metrics.clone(),
            },
        );
    }

    /// Collapse pending signals into decisions, at most one per task.
    pub async fn decide(&mut self, plan: &Plan) -> Vec<ReplanDecision> {
        let pending = std::mem::take(&mut self.pending);
        let mut decisions = Vec::new();

        for (task_id, PendingSignal { signal, metrics }) in pending {
            // The task may have been split away since the signal fired.
            let Some(task) = plan.task(&task_id) else {
                continue;
            };

            let decision = match signal.suggested {
                SuggestedAction::Escalate => {
                    escalate_decision(&signal, "trigger suggested escalation")
                }
                SuggestedAction::Reroute => self.reroute_decision(&signal),
                SuggestedAction::Split(strategy) => {
                    self.split_decision(plan, task, &signal, &metrics, strategy).await
                }
                SuggestedAction::ReEstimate => self.re_estimate_decision(task, &signal).await,
            };

            tracing::info!(
                task_id = %task_id,
                action = %decision.action,
                rationale = %decision.rationale,
                "replan decision"
            );
            decisions.push(decision);
        }

        decisions
    }

    /// Apply a decision's mutations, producing the next plan version.
    ///
    /// All-or-nothing: if the mutated plan fails validation the original
    /// plan stays current and the decision is recorded as rejected -- the
    /// caller replaces it with an escalation.
    pub fn apply(
        &mut self,
        decision: &ReplanDecision,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Plan, ReplanError> {
        let mut next = plan.next_version();

        for mutation in &decision.mutations {
            match mutation {
                PlanMutation::AddTask(task) => next.tasks.push(task.clone()),
                PlanMutation::RemoveTask(id) => next.tasks.retain(|t| &t.id != id),
                PlanMutation::SetDependsOn { task, depends_on } => {
                    match next.task_mut(task) {
                        Some(t) => t.depends_on = depends_on.clone(),
                        None => {
                            return self.reject(decision, now, format!("task {task} not in plan"));
                        }
                    }
                }
                PlanMutation::SetEstimate { task, minutes } => match next.task_mut(task) {
                    Some(t) => t.estimate_minutes = *minutes,
                    None => {
                        return self.reject(decision, now, format!("task {task} not in plan"));
                    }
                },
            }
        }

        if let Err(e) = validate_plan(&next) {
            return self.reject(decision, now, e.to_string());
        }

        self.history.push(DecisionRecord {
            at: now,
            decision: decision.clone(),
            applied: true,
            plan_version: Some(next.version),
        });
        Ok(next)
    }

    /// Decision log, oldest first. Feeds escalation reports.
    pub fn history(&self) -> &[DecisionRecord] {
        &self.history
    }

    /// Decision records concerning one task.
    pub fn history_for(&self, task_id: &TaskId) -> Vec<&DecisionRecord> {
        self.history
            .iter()
            .filter(|r| &r.decision.task_id == task_id)
            .collect()
    }

    /// Reroutes granted to a task so far.
    pub fn reroutes_for(&self, task_id: &TaskId) -> u32 {
        self.reroutes.get(task_id).copied().unwrap_or(0)
    }

    /// Build a split decision on a human's behalf (the Reassign outcome of
    /// an escalation).
    pub fn reassign_decision(
        &self,
        plan: &Plan,
        task: &Task,
        strategy: SplitStrategy,
    ) -> Result<ReplanDecision, crate::split::SplitError> {
        let children = self.splitter.split(task, strategy)?;
        let mutations = split_mutations(plan, task, &children, strategy);
        Ok(ReplanDecision {
            task_id: task.id.clone(),
            action: ReplanAction::Split(strategy),
            rationale: format!("human reassignment: split {strategy} into {}", children.len()),
            mutations,
            signals: Vec::new(),
        })
    }

    fn reject(
        &mut self,
        decision: &ReplanDecision,
        now: DateTime<Utc>,
        reason: String,
    ) -> Result<Plan, ReplanError> {
        tracing::warn!(
            task_id = %decision.task_id,
            action = %decision.action,
            reason = %reason,
            "replan decision rejected"
        );
        self.history.push(DecisionRecord {
            at: now,
            decision: decision.clone(),
            applied: false,
            plan_version: None,
        });
        Err(ReplanError::DecisionRejected {
            task: decision.task_id.clone(),
            reason,
        })
    }

    fn reroute_decision(&mut self, signal: &ReplanSignal) -> ReplanDecision {
        let granted = self.reroutes.entry(signal.task_id.clone()).or_insert(0);
        if *granted >= self.config.max_reroutes {
            return escalate_decision(signal, "reroute budget exhausted");
        }
        *granted += 1;
        ReplanDecision {
            task_id: signal.task_id.clone(),
            action: ReplanAction::Reroute,
            rationale: format!(
                "{}: {} (threshold {}); reroute {} of {}",
                signal.kind, signal.observed, signal.threshold, granted, self.config.max_reroutes
            ),
            mutations: Vec::new(),
            signals: vec![signal.clone()],
        }
    }

    async fn split_decision(
        &self,
        plan: &Plan,
        task: &Task,
        signal: &ReplanSignal,
        metrics: &RunMetrics,
        strategy: SplitStrategy,
    ) -> ReplanDecision {
        // A scope-creep split carves up what the agent actually touched,
        // not the stale declaration.
        let mut subject = task.clone();
        if signal.kind == SignalKind::ScopeCreep && !metrics.touched_files.is_empty() {
            subject.files = metrics.touched_files.clone();
        }

        match self.splitter.split(&subject, strategy) {
            Ok(children) => {
                let mutations = split_mutations(plan, task, &children, strategy);
                ReplanDecision {
                    task_id: task.id.clone(),
                    action: ReplanAction::Split(strategy),
                    rationale: format!(
                        "{}: {} (threshold {}); split into {} tasks",
                        signal.kind,
                        signal.observed,
                        signal.threshold,
                        children.len()
                    ),
                    mutations,
                    signals: vec![signal.clone()],
                }
            }
            Err(e) => {
                tracing::debug!(task_id = %task.id, error = %e, "split not possible, re-estimating");
                self.re_estimate_decision(task, signal).await
            }
        }
    }

    async fn re_estimate_decision(&self, task: &Task, signal: &ReplanSignal) -> ReplanDecision {
        match self.estimator.estimate(task).await {
            Ok(minutes) => ReplanDecision {
                task_id: task.id.clone(),
                action: ReplanAction::ReEstimate,
                rationale: format!(
                    "{}: {} (threshold {}); new estimate {minutes} min",
                    signal.kind, signal.observed, signal.threshold
                ),
                mutations: vec![PlanMutation::SetEstimate {
                    task: task.id.clone(),
                    minutes,
                }],
                signals: vec![signal.clone()],
            },
            Err(e) => escalate_decision(signal, &format!("estimator unavailable: {e}")),
        }
    }
}

/// Mutations that replace a parent task with its children and rewire the
/// parent's dependents.
///
/// Chained strategies terminate in their last child, so dependents hang
/// off that child alone; parallel children all become dependencies.
fn split_mutations(
    plan: &Plan,
    parent: &Task,
    children: &[Task],
    strategy: SplitStrategy,
) -> Vec<PlanMutation> {
    let replacement: Vec<TaskId> = match strategy {
        SplitStrategy::ByFile | SplitStrategy::ByTime => {
            children.last().map(|c| vec![c.id.clone()]).unwrap_or_default()
        }
        SplitStrategy::ByFunctionality => children.iter().map(|c| c.id.clone()).collect(),
    };

    let mut mutations = vec![PlanMutation::RemoveTask(parent.id.clone())];
    mutations.extend(children.iter().cloned().map(PlanMutation::AddTask));

    for dependent in plan.dependents_of(&parent.id) {
        let Some(task) = plan.task(&dependent) else {
            continue;
        };
        let mut depends_on: Vec<TaskId> = task
            .depends_on
            .iter()
            .filter(|d| **d != parent.id)
            .cloned()
            .collect();
        depends_on.extend(replacement.iter().cloned());
        mutations.push(PlanMutation::SetDependsOn {
            task: dependent,
            depends_on,
        });
    }

    mutations
}

fn escalate_decision(signal: &ReplanSignal, extra: &str) -> ReplanDecision {
    ReplanDecision {
        task_id: signal.task_id.clone(),
        action: ReplanAction::Escalate,
        rationale: format!(
            "{}: {} (threshold {}); {extra}",
            signal.kind, signal.observed, signal.threshold
        ),
        mutations: Vec::new(),
        signals: vec![signal.clone()],
    }
}
