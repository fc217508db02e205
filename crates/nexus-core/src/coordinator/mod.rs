//! The top-level driver: runs a plan to completion wave by wave.
//!
//! The coordinator exclusively owns the current plan version and the wave
//! cursor. It dispatches ready tasks through the iterator (bounded
//! concurrency), feeds run metrics to the replanner, applies replan
//! decisions between iterations (never mid-stage), checkpoints at wave
//! boundaries, and routes escalations through the human channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::escalate::{EscalateReason, EscalationHandler};
use crate::event::{EventBus, NexusEvent};
use crate::host::{
    AgentRunner, Clock, ContextProvider, Decomposer, HumanChannel, HumanDecision, KanbanCard,
    PersistenceGateway, PlanSource, QaRunner, RequirementsArtifact, TimeEstimator,
    WorktreeProvider,
};
use crate::iterate::{
    IterateOutcome, IteratorConfig, RalphStyleIterator, RunDirective, Stage, TaskRun,
};
use crate::plan::{Plan, TaskId, TaskStatus, WaveResolver, refresh_ready, validate_plan};
use crate::replan::{
    DynamicReplanner, ReplanAction, ReplanDecision, ReplanError, ReplannerConfig, RunMetrics,
    SignalKind,
};
use crate::split::{SplitConfig, TaskSplitter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens to the dependents of an abandoned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// Mark every transitive dependent abandoned.
    #[default]
    Abandon,
    /// Park dependents as blocked and leave them for a human.
    Pause,
}

/// Coordinator knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Concurrent iterators per wave.
    pub max_concurrent: usize,
    /// Replanner observation tick while a wave is in flight.
    pub replan_tick: Duration,
    pub cascade: CascadePolicy,
    pub iterator: IteratorConfig,
    pub replanner: ReplannerConfig,
    pub splitter: SplitConfig,
    /// Channels escalation notifications go to.
    pub notification_channels: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            replan_tick: Duration::from_secs(5),
            cascade: CascadePolicy::default(),
            iterator: IteratorConfig::default(),
            replanner: ReplannerConfig::default(),
            splitter: SplitConfig::default(),
            notification_channels: Vec::new(),
        }
    }
}

/// The capability bundle a coordinator is built from. All injected; the
/// core keeps no process-wide singletons.
#[derive(Clone)]
pub struct Capabilities {
    pub agent: Arc<dyn AgentRunner>,
    pub context: Arc<dyn ContextProvider>,
    pub qa: Arc<dyn QaRunner>,
    pub worktrees: Arc<dyn WorktreeProvider>,
    pub persistence: Arc<dyn PersistenceGateway>,
    pub human: Arc<dyn HumanChannel>,
    pub clock: Arc<dyn Clock>,
    pub estimator: Arc<dyn TimeEstimator>,
    pub resolver: Arc<dyn WaveResolver>,
}

/// Final outcome of running a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Every task completed.
    Success,
    /// Some tasks ended abandoned or unschedulable.
    Failed {
        abandoned: Vec<TaskId>,
        blocked: Vec<TaskId>,
    },
    /// Cancelled from outside.
    Interrupted,
}

// ---------------------------------------------------------------------------
// Internal wiring
// ---------------------------------------------------------------------------

/// A dispatched task's control surface.
struct Slot {
    directives: mpsc::UnboundedSender<RunDirective>,
}

/// What to do when a suspended run comes back.
enum OnSuspend {
    /// Escalate with the suspended run attached.
    Escalate(Box<ReplanDecision>),
    /// Apply a deferred mutation batch.
    Apply(Box<ReplanDecision>),
}

/// Message from an escalation waiter.
enum HumanMsg {
    Decision {
        package_id: Uuid,
        decision: HumanDecision,
    },
    ChannelFailed {
        task_id: TaskId,
        error: String,
    },
}

/// How a wave ended.
enum WaveEnd {
    Settled,
    Interrupted,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Runs a plan to completion. See the module docs for the loop shape.
pub struct NexusCoordinator {
    config: CoordinatorConfig,
    caps: Capabilities,
    events: EventBus,
    iterator: Arc<RalphStyleIterator>,
    escalation: Arc<EscalationHandler>,
    replanner: DynamicReplanner,
    /// Last sealed run per task, for escalations raised while no run is
    /// live.
    last_runs: HashMap<TaskId, TaskRun>,
    /// Packages that already have a decision waiter spawned; merging more
    /// context into an open package must not spawn a second waiter.
    waiters: HashSet<Uuid>,
}

impl NexusCoordinator {
    pub fn new(config: CoordinatorConfig, caps: Capabilities) -> Self {
        let events = EventBus::default();
        let iterator = Arc::new(RalphStyleIterator::new(
            config.iterator.clone(),
            Arc::clone(&caps.agent),
            Arc::clone(&caps.context),
            Arc::clone(&caps.qa),
            Arc::clone(&caps.worktrees),
            Arc::clone(&caps.clock),
            events.clone(),
        ));
        let escalation = Arc::new(EscalationHandler::new(
            Arc::clone(&caps.worktrees),
            Arc::clone(&caps.persistence),
            Arc::clone(&caps.human),
            Arc::clone(&caps.clock),
            config.notification_channels.clone(),
        ));
        let replanner = DynamicReplanner::new(
            config.replanner.clone(),
            TaskSplitter::new(config.splitter.clone()),
            Arc::clone(&caps.estimator),
        );
        Self {
            config,
            caps,
            events,
            iterator,
            escalation,
            replanner,
            last_runs: HashMap::new(),
            waiters: HashSet::new(),
        }
    }

    /// Event stream handle; subscribe before running for a full account.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// The escalation handler, e.g. for inspecting open packages.
    pub fn escalation(&self) -> Arc<EscalationHandler> {
        Arc::clone(&self.escalation)
    }

    /// Genesis mode: decompose a requirements artifact and run the plan.
    pub async fn run_genesis(
        &mut self,
        decomposer: &dyn Decomposer,
        artifact: RequirementsArtifact,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome> {
        self.run_source(decomposer, PlanSource::Requirements(artifact), cancel)
            .await
    }

    /// Evolution mode: one Kanban card drives one mini-plan through the
    /// same loop.
    pub async fn run_evolution(
        &mut self,
        decomposer: &dyn Decomposer,
        card: KanbanCard,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome> {
        self.run_source(decomposer, PlanSource::Kanban(card), cancel)
            .await
    }

    async fn run_source(
        &mut self,
        decomposer: &dyn Decomposer,
        source: PlanSource,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome> {
        let plan = decomposer
            .decompose(&source)
            .await
            .context("decomposer failed to produce a plan")?;
        self.run_plan(plan, cancel).await
    }

    /// Resume from a stored checkpoint: rebuild the plan, requeue the
    /// cursor, run the shared loop.
    pub async fn resume_from_checkpoint(
        &mut self,
        checkpoint_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome> {
        let checkpoint = self
            .caps
            .persistence
            .read_checkpoint(checkpoint_id)
            .await?
            .with_context(|| format!("checkpoint {checkpoint_id} not found"))?;
        self.run_plan(checkpoint.restore_plan(), cancel).await
    }

    /// Run a plan to completion.
    pub async fn run_plan(&mut self, plan: Plan, cancel: CancellationToken) -> Result<PlanOutcome> {
        validate_plan(&plan).context("refusing to run an invalid plan")?;
        let mut plan = plan;

        tracing::info!(
            plan_id = %plan.id,
            plan_name = %plan.name,
            tasks = plan.tasks.len(),
            "coordinator starting"
        );

        // Escalation decisions survive wave boundaries.
        let (human_tx, mut human_rx) = mpsc::unbounded_channel::<HumanMsg>();

        loop {
            if cancel.is_cancelled() {
                return Ok(PlanOutcome::Interrupted);
            }

            refresh_ready(&mut plan);
            let waves = self.caps.resolver.resolve(&plan)?;
            let wave: Vec<TaskId> = waves.first().map(|w| w.tasks.clone()).unwrap_or_default();

            if wave.is_empty() {
                if !plan.has_open_tasks() {
                    return Ok(self.finish(&plan));
                }

                // Open tasks remain but nothing is schedulable: they wait
                // on escalated or blocked work.
                let escalated_exists = plan
                    .tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Escalated);
                if !escalated_exists {
                    return Ok(self.finish(&plan));
                }

                tokio::select! {
                    msg = human_rx.recv() => {
                        if let Some(msg) = msg {
                            self.handle_human(&mut plan, msg, &human_tx).await?;
                        }
                    }
                    () = cancel.cancelled() => return Ok(PlanOutcome::Interrupted),
                }
                continue;
            }

            // Pre-wave checkpoint: recovery point with the in-flight wave
            // as cursor.
            let mut pre = Checkpoint::capture(&plan, self.caps.clock.now());
            pre.iterator_cursor = Some(wave.clone());
            self.caps
                .persistence
                .write_checkpoint(&pre)
                .await
                .context("failed to write pre-wave checkpoint")?;
            tracing::debug!(checkpoint_id = %pre.id, wave = wave.len(), "pre-wave checkpoint");

            match self
                .run_wave(&mut plan, &wave, &human_tx, &mut human_rx, &cancel)
                .await?
            {
                WaveEnd::Settled => {}
                WaveEnd::Interrupted => return Ok(PlanOutcome::Interrupted),
            }

            // Post-wave checkpoint.
            let post = Checkpoint::capture(&plan, self.caps.clock.now());
            self.caps
                .persistence
                .write_checkpoint(&post)
                .await
                .context("failed to write post-wave checkpoint")?;
            self.events.emit(NexusEvent::WaveCheckpointed {
                checkpoint_id: post.id,
                wave_size: wave.len(),
            });
        }
    }

    /// Dispatch one wave and pump messages until every slot settles.
    async fn run_wave(
        &mut self,
        plan: &mut Plan,
        wave: &[TaskId],
        human_tx: &mpsc::UnboundedSender<HumanMsg>,
        human_rx: &mut mpsc::UnboundedReceiver<HumanMsg>,
        cancel: &CancellationToken,
    ) -> Result<WaveEnd> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(TaskId, IterateOutcome)>();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<RunMetrics>();
        let mut status_rx = self.events.subscribe();

        let mut slots: HashMap<TaskId, Slot> = HashMap::new();
        let mut on_suspend: HashMap<TaskId, OnSuspend> = HashMap::new();

        for task_id in wave {
            let Some(task) = plan.task_mut(task_id) else {
                continue;
            };
            task.status = TaskStatus::Running;
            let task = task.clone();

            let (dir_tx, mut dir_rx) = mpsc::unbounded_channel::<RunDirective>();
            slots.insert(task.id.clone(), Slot { directives: dir_tx });

            let iterator = Arc::clone(&self.iterator);
            let semaphore = Arc::clone(&semaphore);
            let done = done_tx.clone();
            let progress = progress_tx.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let outcome = iterator.run(&task, &mut dir_rx, &progress).await;
                let _ = done.send((task.id.clone(), outcome));
            });
        }
        drop(done_tx);

        // The tick future must not borrow `self`, so the handlers below can.
        let tick_clock = Arc::clone(&self.caps.clock);
        let tick_len = self.config.replan_tick;

        let mut in_flight = slots.len();
        while in_flight > 0 {
            tokio::select! {
                Some((task_id, outcome)) = done_rx.recv() => {
                    in_flight -= 1;
                    slots.remove(&task_id);
                    let deferred = on_suspend.remove(&task_id);
                    self.handle_outcome(
                        plan, &task_id, outcome, deferred, &mut slots, &mut on_suspend, human_tx,
                    )
                    .await?;
                }
                Some(metrics) = progress_rx.recv() => {
                    self.observe(plan, &metrics);
                    self.apply_decisions(plan, &mut slots, &mut on_suspend, human_tx).await?;
                }
                event = status_rx.recv() => {
                    if let Ok(event) = event {
                        track_status(plan, &event);
                    }
                }
                Some(msg) = human_rx.recv() => {
                    self.handle_human(plan, msg, human_tx).await?;
                }
                () = tick_clock.sleep(tick_len) => {
                    self.apply_decisions(plan, &mut slots, &mut on_suspend, human_tx).await?;
                }
                () = cancel.cancelled() => {
                    tracing::info!("wave cancelled, suspending in-flight runs");
                    for slot in slots.values() {
                        let _ = slot.directives.send(RunDirective::Suspend);
                    }
                    // Cooperative drain: runs stop at their next iteration
                    // boundary.
                    while in_flight > 0 {
                        match done_rx.recv().await {
                            Some((task_id, outcome)) => {
                                in_flight -= 1;
                                match outcome {
                                    IterateOutcome::Done { run } => {
                                        self.last_runs.insert(task_id.clone(), run);
                                        if let Some(task) = plan.task_mut(&task_id) {
                                            task.status = TaskStatus::Completed;
                                        }
                                        self.events.emit(NexusEvent::TaskCompleted { task_id });
                                    }
                                    IterateOutcome::Suspended { run } => {
                                        self.last_runs.insert(task_id.clone(), run);
                                        if let Some(task) = plan.task_mut(&task_id) {
                                            task.status = TaskStatus::Ready;
                                        }
                                    }
                                    _ => {}
                                }
                            }
                            None => break,
                        }
                    }
                    return Ok(WaveEnd::Interrupted);
                }
            }
        }

        Ok(WaveEnd::Settled)
    }

    /// Route a settled run back into the plan.
    #[allow(clippy::too_many_arguments)]
    async fn handle_outcome(
        &mut self,
        plan: &mut Plan,
        task_id: &TaskId,
        outcome: IterateOutcome,
        deferred: Option<OnSuspend>,
        slots: &mut HashMap<TaskId, Slot>,
        on_suspend: &mut HashMap<TaskId, OnSuspend>,
        human_tx: &mpsc::UnboundedSender<HumanMsg>,
    ) -> Result<()> {
        match outcome {
            IterateOutcome::Done { run } => {
                tracing::info!(task_id = %task_id, iterations = run.iterations, "task completed");
                self.last_runs.insert(task_id.clone(), run);
                if let Some(task) = plan.task_mut(task_id) {
                    task.status = TaskStatus::Completed;
                }
                self.events.emit(NexusEvent::TaskCompleted {
                    task_id: task_id.clone(),
                });
            }

            IterateOutcome::Escalated { run, reason } => {
                self.escalate_task(plan, task_id, run, reason, human_tx).await?;
            }

            IterateOutcome::Abandoned { run, fault } => {
                tracing::error!(task_id = %task_id, fault = %fault, "iterator fault, abandoning");
                self.last_runs.insert(task_id.clone(), run);
                self.abandon_task(plan, task_id, &format!("iterator fault: {fault}"));
            }

            IterateOutcome::ReplanRequested { run } => {
                // Forward the complexity signal and replan immediately;
                // the task waits for the new plan version.
                if let Some(task) = plan.task(task_id).cloned() {
                    let metrics = run.metrics(&task, self.caps.clock.now());
                    self.replanner.observe(&task, &metrics);
                }
                self.last_runs.insert(task_id.clone(), run);
                if let Some(task) = plan.task_mut(task_id) {
                    task.status = TaskStatus::Ready;
                }
                self.apply_decisions(plan, slots, on_suspend, human_tx).await?;
            }

            IterateOutcome::Suspended { run } => {
                self.last_runs.insert(task_id.clone(), run.clone());
                match deferred {
                    Some(OnSuspend::Escalate(decision)) => {
                        let reason = escalate_reason(&decision);
                        self.escalate_task(plan, task_id, run, reason, human_tx).await?;
                    }
                    Some(OnSuspend::Apply(decision)) => {
                        self.apply_one(plan, &decision, human_tx).await?;
                        if let Some(task) = plan.task_mut(task_id) {
                            if task.status == TaskStatus::Running {
                                task.status = TaskStatus::Ready;
                            }
                        }
                    }
                    None => {
                        // Suspended without a pending action (cancellation
                        // race); requeue.
                        if let Some(task) = plan.task_mut(task_id) {
                            task.status = TaskStatus::Ready;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Feed the replanner one metrics snapshot.
    fn observe(&mut self, plan: &Plan, metrics: &RunMetrics) {
        if let Some(task) = plan.task(&metrics.task_id) {
            self.replanner.observe(task, metrics);
        }
    }

    /// Collapse pending signals into decisions and apply them.
    ///
    /// Decisions touching a running task suspend it first and apply at its
    /// iteration boundary; everything else applies immediately.
    async fn apply_decisions(
        &mut self,
        plan: &mut Plan,
        slots: &mut HashMap<TaskId, Slot>,
        on_suspend: &mut HashMap<TaskId, OnSuspend>,
        human_tx: &mpsc::UnboundedSender<HumanMsg>,
    ) -> Result<()> {
        let decisions = self.replanner.decide(plan).await;

        for decision in decisions {
            let task_id = decision.task_id.clone();
            let running = slots.contains_key(&task_id);

            match decision.action.clone() {
                ReplanAction::Reroute => {
                    if let Some(slot) = slots.get(&task_id) {
                        let hint = reroute_hint(&decision);
                        let _ = slot.directives.send(RunDirective::Reroute { hint });
                    } else {
                        tracing::debug!(task_id = %task_id, "reroute for settled run ignored");
                    }
                }

                ReplanAction::Escalate => {
                    if running {
                        if let Some(slot) = slots.get(&task_id) {
                            let _ = slot.directives.send(RunDirective::Suspend);
                        }
                        on_suspend.insert(task_id, OnSuspend::Escalate(Box::new(decision)));
                    } else {
                        let run = self.take_run(&task_id);
                        let reason = escalate_reason(&decision);
                        self.escalate_task(plan, &task_id, run, reason, human_tx)
                            .await?;
                    }
                }

                ReplanAction::Split(_) | ReplanAction::ReEstimate => {
                    if running {
                        if let Some(slot) = slots.get(&task_id) {
                            let _ = slot.directives.send(RunDirective::Suspend);
                        }
                        on_suspend.insert(task_id, OnSuspend::Apply(Box::new(decision)));
                    } else {
                        self.apply_one(plan, &decision, human_tx).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one mutation-bearing decision; a rejection downgrades to an
    /// escalation of the affected task.
    async fn apply_one(
        &mut self,
        plan: &mut Plan,
        decision: &ReplanDecision,
        human_tx: &mpsc::UnboundedSender<HumanMsg>,
    ) -> Result<()> {
        match self
            .replanner
            .apply(decision, plan, self.caps.clock.now())
        {
            Ok(next) => {
                *plan = next;
                self.events.emit(NexusEvent::ReplanApplied {
                    plan_version: plan.version,
                    task_id: decision.task_id.clone(),
                    action: decision.action.to_string(),
                });
            }
            Err(ReplanError::DecisionRejected { task, reason }) => {
                let run = self.take_run(&task);
                self.escalate_task(
                    plan,
                    &task,
                    run,
                    EscalateReason::ReplanRejected { detail: reason },
                    human_tx,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Freeze a task behind an escalation package and spawn the waiter
    /// that feeds the human decision back in.
    async fn escalate_task(
        &mut self,
        plan: &mut Plan,
        task_id: &TaskId,
        run: TaskRun,
        reason: EscalateReason,
        human_tx: &mpsc::UnboundedSender<HumanMsg>,
    ) -> Result<()> {
        let Some(task) = plan.task(task_id).cloned() else {
            tracing::warn!(task_id = %task_id, "escalation for a task no longer in plan");
            return Ok(());
        };

        self.last_runs.insert(task_id.clone(), run.clone());
        let records = self.replanner.history_for(task_id);
        let package = self
            .escalation
            .escalate(&task, run, reason, plan, &records)
            .await?;

        if let Some(task) = plan.task_mut(task_id) {
            task.status = TaskStatus::Escalated;
        }
        self.events.emit(NexusEvent::Escalated {
            task_id: task_id.clone(),
            package_id: package.id,
        });

        if !self.waiters.insert(package.id) {
            // Context merged into an already-watched package.
            return Ok(());
        }

        let handler = Arc::clone(&self.escalation);
        let tx = human_tx.clone();
        let waiter_task = task_id.clone();
        let package_id = package.id;
        tokio::spawn(async move {
            match handler.await_decision(package_id).await {
                Ok(decision) => {
                    let _ = tx.send(HumanMsg::Decision {
                        package_id,
                        decision,
                    });
                }
                Err(e) => {
                    let _ = tx.send(HumanMsg::ChannelFailed {
                        task_id: waiter_task,
                        error: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    /// Apply a human decision to the plan.
    async fn handle_human(
        &mut self,
        plan: &mut Plan,
        msg: HumanMsg,
        human_tx: &mpsc::UnboundedSender<HumanMsg>,
    ) -> Result<()> {
        match msg {
            HumanMsg::ChannelFailed { task_id, error } => {
                // The package stays open but nothing will ever answer it;
                // park the task so the plan can settle as failed.
                tracing::error!(task_id = %task_id, error = %error, "human channel failed");
                if let Some(task) = plan.task_mut(&task_id) {
                    task.status = TaskStatus::Blocked;
                }
            }
            HumanMsg::Decision {
                package_id,
                decision,
            } => {
                self.waiters.remove(&package_id);
                let (task_id, decision) = self.escalation.resume(package_id, decision).await?;
                match decision {
                    HumanDecision::Resume => {
                        if let Some(task) = plan.task_mut(&task_id) {
                            task.status = TaskStatus::Ready;
                        }
                        self.events.emit(NexusEvent::Resumed {
                            task_id: task_id.clone(),
                        });
                    }
                    HumanDecision::Abandon => {
                        self.abandon_task(plan, &task_id, "abandoned by human decision");
                    }
                    HumanDecision::Reassign(strategy) => {
                        let Some(task) = plan.task(&task_id).cloned() else {
                            return Ok(());
                        };
                        match self.replanner.reassign_decision(plan, &task, strategy) {
                            Ok(decision) => {
                                // Reuse the normal apply path; a rejection
                                // re-escalates.
                                self.apply_one(plan, &decision, human_tx).await?;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    task_id = %task_id,
                                    error = %e,
                                    "reassignment split failed, requeueing unchanged"
                                );
                                if let Some(task) = plan.task_mut(&task_id) {
                                    task.status = TaskStatus::Ready;
                                }
                                self.events.emit(NexusEvent::Resumed { task_id });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Mark a task abandoned and cascade per policy.
    fn abandon_task(&mut self, plan: &mut Plan, task_id: &TaskId, reason: &str) {
        if let Some(task) = plan.task_mut(task_id) {
            task.status = TaskStatus::Abandoned;
        }
        self.events.emit(NexusEvent::TaskAbandoned {
            task_id: task_id.clone(),
            reason: reason.to_owned(),
        });

        let dependents = plan.transitive_dependents(task_id);
        for dependent in dependents {
            let Some(task) = plan.task_mut(&dependent) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            match self.config.cascade {
                CascadePolicy::Abandon => {
                    task.status = TaskStatus::Abandoned;
                    self.events.emit(NexusEvent::TaskAbandoned {
                        task_id: dependent,
                        reason: format!("dependency {task_id} abandoned"),
                    });
                }
                CascadePolicy::Pause => {
                    task.status = TaskStatus::Blocked;
                }
            }
        }
    }

    /// The last sealed run for a task, or an empty placeholder when the
    /// task never ran.
    fn take_run(&mut self, task_id: &TaskId) -> TaskRun {
        self.last_runs
            .remove(task_id)
            .unwrap_or_else(|| TaskRun::new(task_id.clone(), self.caps.clock.now()))
    }

    /// Terminal accounting and the closing event.
    fn finish(&self, plan: &Plan) -> PlanOutcome {
        let abandoned: Vec<TaskId> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Abandoned)
            .map(|t| t.id.clone())
            .collect();
        let blocked: Vec<TaskId> = plan
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        let success = abandoned.is_empty() && blocked.is_empty();
        self.events.emit(NexusEvent::PlanCompleted {
            plan_id: plan.id,
            success,
        });
        tracing::info!(
            plan_id = %plan.id,
            success,
            abandoned = abandoned.len(),
            blocked = blocked.len(),
            "plan finished"
        );

        if success {
            PlanOutcome::Success
        } else {
            PlanOutcome::Failed { abandoned, blocked }
        }
    }
}

/// Keep plan statuses in step with stage events: in QA during
/// build/lint/test, needs-review while the reviewer looks, running while
/// coding.
fn track_status(plan: &mut Plan, event: &NexusEvent) {
    match event {
        NexusEvent::StageEntered { task_id, stage, .. } => {
            if let Some(task) = plan.task_mut(task_id) {
                if task.status == TaskStatus::Running || task.status == TaskStatus::InQa {
                    task.status = if *stage == Stage::Review {
                        TaskStatus::NeedsReview
                    } else {
                        TaskStatus::InQa
                    };
                }
            }
        }
        NexusEvent::IterationAdvanced { task_id, .. } => {
            if let Some(task) = plan.task_mut(task_id) {
                if matches!(task.status, TaskStatus::InQa | TaskStatus::NeedsReview) {
                    task.status = TaskStatus::Running;
                }
            }
        }
        _ => {}
    }
}

/// The hint a rerouted run carries into its next iteration.
fn reroute_hint(decision: &ReplanDecision) -> String {
    format!(
        "The current approach keeps failing ({}). Try a substantially different approach.",
        decision.rationale
    )
}

/// Translate a replanner escalation into a reason for the package.
fn escalate_reason(decision: &ReplanDecision) -> EscalateReason {
    match decision.signals.first().map(|s| s.kind) {
        Some(SignalKind::RepeatedFailure) => EscalateReason::RepeatedFailure {
            fingerprint: decision
                .signals
                .first()
                .map(|s| s.observed.clone())
                .unwrap_or_default(),
        },
        _ => EscalateReason::ReplanEscalation {
            rationale: decision.rationale.clone(),
        },
    }
}
