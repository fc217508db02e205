//! The per-task iteration engine: a bounded build/lint/test/review/merge
//! loop cooperating with an external agent and the host's QA callbacks.
//!
//! One call to [`RalphStyleIterator::run`] drives one task from ready to a
//! terminal outcome. Suspension happens only at capability calls; stage
//! transitions within a run are strictly serial.

pub mod run;
pub mod stage;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use crate::escalate::EscalateReason;
use crate::event::{EventBus, NexusEvent};
use crate::host::{
    AGENT_TOOLS, AgentContext, AgentRunner, AgentStepResult, Clock, ContextProvider, MergeOutcome,
    QaRunner, RunnerError, WorktreeProvider, with_deadline,
};
use crate::plan::Task;
use crate::replan::signal::RunMetrics;

pub use run::{StageRecord, TaskRun};
pub use stage::{
    Diagnostic, Fingerprint, ReviewOutcome, ReviewVerdict, Stage, StageResult, file_set_hash,
};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// States of the per-task machine.
///
/// ```text
/// Starting -> Coding -> Building -> Linting -> Testing -> Reviewing -> Merging -> Done
///                ^          |           |          |           |
///                |      FixingBuild FixingLint FixingTest FixingReview
///                +----------+-----------+----------+-----------+
/// ```
///
/// Terminal branches: `Escalated`, `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    Starting,
    Coding,
    Building,
    Linting,
    Testing,
    Reviewing,
    Merging,
    FixingBuild,
    FixingLint,
    FixingTest,
    FixingReview,
    Done,
    Escalated,
    Abandoned,
}

impl IterState {
    fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Build => Self::Building,
            Stage::Lint => Self::Linting,
            Stage::Test => Self::Testing,
            Stage::Review => Self::Reviewing,
        }
    }

    fn fixing(stage: Stage) -> Self {
        match stage {
            Stage::Build => Self::FixingBuild,
            Stage::Lint => Self::FixingLint,
            Stage::Test => Self::FixingTest,
            Stage::Review => Self::FixingReview,
        }
    }
}

impl fmt::Display for IterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Coding => "coding",
            Self::Building => "building",
            Self::Linting => "linting",
            Self::Testing => "testing",
            Self::Reviewing => "reviewing",
            Self::Merging => "merging",
            Self::FixingBuild => "fixing_build",
            Self::FixingLint => "fixing_lint",
            Self::FixingTest => "fixing_test",
            Self::FixingReview => "fixing_review",
            Self::Done => "done",
            Self::Escalated => "escalated",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Configuration & outcomes
// ---------------------------------------------------------------------------

/// Bounds and timeouts for one task run.
#[derive(Debug, Clone)]
pub struct IteratorConfig {
    /// Hard cap on coding iterations per run.
    pub max_iterations: u32,
    /// Wall-clock cap per run.
    pub wall_clock_cap: Duration,
    pub build_timeout: Duration,
    pub lint_timeout: Duration,
    pub test_timeout: Duration,
    pub review_timeout: Duration,
    /// Attempts per external call before a transient failure escalates.
    pub transient_retry_max: u32,
    /// Base delay of the exponential backoff between transient retries.
    pub backoff_base: Duration,
    /// Context fetches allowed within a single iteration before the agent
    /// counts as misbehaving.
    pub max_context_requests: u32,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            wall_clock_cap: Duration::from_secs(30 * 60),
            build_timeout: Duration::from_secs(5 * 60),
            lint_timeout: Duration::from_secs(2 * 60),
            test_timeout: Duration::from_secs(10 * 60),
            review_timeout: Duration::from_secs(5 * 60),
            transient_retry_max: 3,
            backoff_base: Duration::from_millis(250),
            max_context_requests: 8,
        }
    }
}

impl IteratorConfig {
    fn stage_timeout(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Build => self.build_timeout,
            Stage::Lint => self.lint_timeout,
            Stage::Test => self.test_timeout,
            Stage::Review => self.review_timeout,
        }
    }
}

/// How a task run ended.
#[derive(Debug)]
pub enum IterateOutcome {
    /// Merged cleanly.
    Done { run: TaskRun },
    /// A cap breached, a review rejected, a merge conflicted twice, or
    /// tooling failed beyond retries.
    Escalated { run: TaskRun, reason: EscalateReason },
    /// Internal invariant violation; no retry.
    Abandoned { run: TaskRun, fault: String },
    /// The agent asked for a replan; the task waits for a new plan
    /// version.
    ReplanRequested { run: TaskRun },
    /// The coordinator asked the run to stop between iterations.
    Suspended { run: TaskRun },
}

/// Instructions the coordinator may inject between iterations.
#[derive(Debug, Clone)]
pub enum RunDirective {
    /// Try a different approach; the hint lands in the agent context.
    Reroute { hint: String },
    /// Stop at the next iteration boundary.
    Suspend,
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

/// Drives one task through the bounded coding/QA/merge loop.
pub struct RalphStyleIterator {
    config: IteratorConfig,
    agent: Arc<dyn AgentRunner>,
    context: Arc<dyn ContextProvider>,
    qa: Arc<dyn QaRunner>,
    worktrees: Arc<dyn WorktreeProvider>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Result of one agent step after retries and context fetches.
enum AgentStep {
    Completed(AgentStepResult),
    Misbehaved(Diagnostic),
    ToolFailure(String),
}

impl RalphStyleIterator {
    pub fn new(
        config: IteratorConfig,
        agent: Arc<dyn AgentRunner>,
        context: Arc<dyn ContextProvider>,
        qa: Arc<dyn QaRunner>,
        worktrees: Arc<dyn WorktreeProvider>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            agent,
            context,
            qa,
            worktrees,
            clock,
            events,
        }
    }

    /// Run `task` to a terminal outcome.
    ///
    /// `directives` is drained at iteration boundaries only, so replan
    /// effects are observable in the next iteration's context, never
    /// mid-stage. `progress` receives a metrics snapshot after every
    /// stage transition.
    pub async fn run(
        &self,
        task: &Task,
        directives: &mut mpsc::UnboundedReceiver<RunDirective>,
        progress: &mpsc::UnboundedSender<RunMetrics>,
    ) -> IterateOutcome {
        let mut run = TaskRun::new(task.id.clone(), self.clock.now());
        self.events.emit(NexusEvent::TaskStarted {
            task_id: task.id.clone(),
        });

        // Isolated worktree, one per concurrent task.
        let worktree = match self.acquire_worktree(task).await {
            Ok(handle) => {
                run.worktree = Some(handle.clone());
                handle
            }
            Err(detail) => {
                return self.escalate(task, run, EscalateReason::ToolFailure { detail }, progress);
            }
        };

        let mut state = IterState::Starting;
        // Stages that have passed against the current file-set hash.
        let mut green: Vec<Stage> = Vec::new();
        // Diagnostics carried into the next coding pass.
        let mut pending: Vec<Diagnostic> = Vec::new();

        loop {
            let elapsed = run.elapsed_minutes(self.clock.now());
            if elapsed >= self.config.wall_clock_cap.as_secs_f64() / 60.0 {
                return self.escalate(
                    task,
                    run,
                    EscalateReason::WallClockCap {
                        elapsed_minutes: elapsed,
                    },
                    progress,
                );
            }

            match state {
                IterState::Starting => state = IterState::Coding,

                IterState::Coding => {
                    // Iteration boundary: apply queued directives first.
                    while let Ok(directive) = directives.try_recv() {
                        match directive {
                            RunDirective::Suspend => {
                                tracing::info!(task_id = %task.id, "run suspended by coordinator");
                                run.seal(self.clock.now());
                                return IterateOutcome::Suspended { run };
                            }
                            RunDirective::Reroute { hint } => {
                                tracing::info!(task_id = %task.id, hint = %hint, "reroute applied");
                                run.reroutes += 1;
                                run.reroute_hints.push(hint);
                            }
                        }
                    }

                    run.iterations += 1;
                    if run.iterations > self.config.max_iterations {
                        // The failure sites cap first; this is the backstop.
                        return self.escalate(
                            task,
                            run,
                            EscalateReason::IterationCap {
                                iterations: self.config.max_iterations,
                            },
                            progress,
                        );
                    }
                    self.events.emit(NexusEvent::IterationAdvanced {
                        task_id: task.id.clone(),
                        iteration: run.iterations,
                    });

                    match self.agent_step(task, &run, &worktree, &pending).await {
                        AgentStep::Completed(step) => {
                            if step.requested_replan {
                                run.replan_requested = true;
                                self.publish(task, &run, progress);
                                tracing::info!(task_id = %task.id, "agent requested a replan");
                                return IterateOutcome::ReplanRequested { run };
                            }
                            // A coding pass that modified files invalidates
                            // earlier green stages; QA restarts from the
                            // build. A pass that touched nothing (e.g. the
                            // reviewer asked for clarification only) resumes
                            // at the first non-green stage.
                            run.record_touched(&step.files_touched);
                            if !step.files_touched.is_empty() {
                                green.clear();
                            }
                            pending.clear();
                            state = next_pending_stage(&green);
                        }
                        AgentStep::Misbehaved(diagnostic) => {
                            tracing::warn!(
                                task_id = %task.id,
                                diagnostic = %diagnostic,
                                "agent misbehaved after corrective retry"
                            );
                            run.record_misbehavior(&diagnostic);
                            pending = vec![diagnostic];
                            self.publish(task, &run, progress);
                            if run.iterations >= self.config.max_iterations {
                                return self.escalate(
                                    task,
                                    run,
                                    EscalateReason::IterationCap {
                                        iterations: self.config.max_iterations,
                                    },
                                    progress,
                                );
                            }
                            // Stay in Coding; the next pass carries the
                            // misbehavior diagnostic.
                        }
                        AgentStep::ToolFailure(detail) => {
                            return self.escalate(
                                task,
                                run,
                                EscalateReason::ToolFailure { detail },
                                progress,
                            );
                        }
                    }
                }

                IterState::Building | IterState::Linting | IterState::Testing => {
                    let stage = match state {
                        IterState::Building => Stage::Build,
                        IterState::Linting => Stage::Lint,
                        _ => Stage::Test,
                    };
                    match self.qa_stage(task, &mut run, &worktree, stage, progress).await {
                        Ok(result) => {
                            if result.passed {
                                green.push(stage);
                                state = next_pending_stage(&green);
                            } else {
                                pending = result.diagnostics.clone();
                                if run.iterations >= self.config.max_iterations {
                                    let iterations = run.iterations;
                                    return self.escalate(
                                        task,
                                        run,
                                        EscalateReason::IterationCap { iterations },
                                        progress,
                                    );
                                }
                                state = IterState::fixing(stage);
                            }
                        }
                        Err(detail) => {
                            return self.escalate(
                                task,
                                run,
                                EscalateReason::ToolFailure { detail },
                                progress,
                            );
                        }
                    }
                }

                IterState::Reviewing => match self
                    .review_stage(task, &mut run, &worktree, progress)
                    .await
                {
                    Ok(outcome) => {
                        if outcome.scope_too_large {
                            run.review_scope_too_large = true;
                            self.publish(task, &run, progress);
                        }
                        match outcome.verdict {
                            ReviewVerdict::Approve => {
                                green.push(Stage::Review);
                                state = IterState::Merging;
                            }
                            ReviewVerdict::RequestChanges => {
                                pending = outcome.result.diagnostics.clone();
                                if run.iterations >= self.config.max_iterations {
                                    let iterations = run.iterations;
                                    return self.escalate(
                                        task,
                                        run,
                                        EscalateReason::IterationCap { iterations },
                                        progress,
                                    );
                                }
                                state = IterState::FixingReview;
                            }
                            ReviewVerdict::Reject => {
                                let summary = outcome.result.summary.clone();
                                return self.escalate(
                                    task,
                                    run,
                                    EscalateReason::ReviewRejected { summary },
                                    progress,
                                );
                            }
                        }
                    }
                    Err(detail) => {
                        return self.escalate(
                            task,
                            run,
                            EscalateReason::ToolFailure { detail },
                            progress,
                        );
                    }
                },

                IterState::FixingBuild
                | IterState::FixingLint
                | IterState::FixingTest
                | IterState::FixingReview => {
                    // The fix happens in the next coding pass with the
                    // failure diagnostics injected.
                    state = IterState::Coding;
                }

                IterState::Merging => {
                    match self.merge(task, &worktree).await {
                        Ok(MergeOutcome::Merged { commit }) => {
                            tracing::info!(task_id = %task.id, commit = %commit, "task merged");
                            run.seal(self.clock.now());
                            self.publish(task, &run, progress);
                            self.release_worktree(&mut run).await;
                            return IterateOutcome::Done { run };
                        }
                        Ok(MergeOutcome::Conflicts { report }) => {
                            return self.escalate(
                                task,
                                run,
                                EscalateReason::MergeConflict { report },
                                progress,
                            );
                        }
                        Err(detail) => {
                            return self.escalate(
                                task,
                                run,
                                EscalateReason::ToolFailure { detail },
                                progress,
                            );
                        }
                    }
                }

                IterState::Done | IterState::Escalated | IterState::Abandoned => {
                    // Terminal states return directly; reaching here is a
                    // dispatcher bug.
                    run.seal(self.clock.now());
                    return IterateOutcome::Abandoned {
                        run,
                        fault: format!("dispatcher re-entered terminal state {state}"),
                    };
                }
            }
        }
    }

    // -- agent ---------------------------------------------------------------

    /// One coding pass: transient retries, one corrective retry on
    /// misbehavior, and context fetches within the same iteration.
    async fn agent_step(
        &self,
        task: &Task,
        run: &TaskRun,
        worktree: &crate::host::WorktreeHandle,
        pending: &[Diagnostic],
    ) -> AgentStep {
        let mut extra_context: Vec<String> = Vec::new();
        let mut strict = false;
        let mut context_fetches = 0u32;

        loop {
            let context = AgentContext {
                iteration: run.iterations,
                diagnostics: pending.to_vec(),
                extra_context: extra_context.clone(),
                reroute_hints: run.reroute_hints.clone(),
                strict,
            };

            let mut attempt = 0u32;
            // Ok(step): agent produced a result. Err(Some(outcome)):
            // terminal. Err(None): rebuild the context (stricter prompt)
            // and re-invoke.
            let step = loop {
                attempt += 1;
                match self
                    .agent
                    .run_agent(task, &context, AGENT_TOOLS, worktree)
                    .await
                {
                    Ok(step) => break Ok(step),
                    Err(RunnerError::Transient(detail)) => {
                        if attempt >= self.config.transient_retry_max {
                            break Err(Some(AgentStep::ToolFailure(detail)));
                        }
                        tracing::debug!(
                            task_id = %task.id,
                            attempt,
                            detail = %detail,
                            "transient agent failure, backing off"
                        );
                        self.backoff(attempt).await;
                    }
                    Err(RunnerError::Misbehavior(detail)) => {
                        if strict {
                            break Err(Some(AgentStep::Misbehaved(Diagnostic::message(
                                format!("agent misbehaved twice: {detail}"),
                            ))));
                        }
                        tracing::warn!(
                            task_id = %task.id,
                            detail = %detail,
                            "agent misbehaved, retrying with a stricter prompt"
                        );
                        strict = true;
                        break Err(None);
                    }
                }
            };

            let step = match step {
                Ok(step) => step,
                Err(Some(outcome)) => return outcome,
                Err(None) => continue,
            };

            // `request-context` re-invokes the agent with the answer,
            // within the same iteration.
            if let Some(query) = step.requested_context {
                if context_fetches >= self.config.max_context_requests {
                    return AgentStep::Misbehaved(Diagnostic::message(format!(
                        "agent requested context {context_fetches} times in one iteration"
                    )));
                }
                context_fetches += 1;
                let answer = match self.context.provide(task, &query).await {
                    Ok(answer) => answer,
                    Err(e) => format!("context unavailable: {e}"),
                };
                extra_context.push(answer);
                continue;
            }

            return AgentStep::Completed(step);
        }
    }

    // -- QA ------------------------------------------------------------------

    /// Run one QA stage with its deadline and transient retries. A missing
    /// callback is an automatic pass.
    async fn qa_stage(
        &self,
        task: &Task,
        run: &mut TaskRun,
        worktree: &crate::host::WorktreeHandle,
        stage: Stage,
        progress: &mpsc::UnboundedSender<RunMetrics>,
    ) -> Result<StageResult, String> {
        self.events.emit(NexusEvent::StageEntered {
            task_id: task.id.clone(),
            stage,
            iteration: run.iterations,
        });

        let timeout = self.config.stage_timeout(stage);
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            let call = async {
                match stage {
                    Stage::Build => self.qa.build(task, worktree).await,
                    Stage::Lint => self.qa.lint(task, worktree).await,
                    Stage::Test => self.qa.test(task, worktree).await,
                    Stage::Review => unreachable!("review runs through review_stage"),
                }
            };
            match with_deadline(self.clock.as_ref(), timeout, call).await {
                Some(Ok(Some(result))) => break result,
                Some(Ok(None)) => break StageResult::auto_pass(),
                Some(Err(e)) => {
                    if attempt >= self.config.transient_retry_max {
                        return Err(format!("{stage} stage failed: {e}"));
                    }
                    tracing::debug!(task_id = %task.id, stage = %stage, error = %e, "stage error, retrying");
                    self.backoff(attempt).await;
                }
                None => {
                    if attempt >= self.config.transient_retry_max {
                        return Err(format!("{stage} stage timed out after {timeout:?}"));
                    }
                    tracing::warn!(task_id = %task.id, stage = %stage, "stage deadline hit, retrying");
                    self.backoff(attempt).await;
                }
            }
        };

        let passed = result.passed;
        run.record_stage(stage, result.clone());
        self.events.emit(NexusEvent::StageCompleted {
            task_id: task.id.clone(),
            stage,
            iteration: run.iterations,
            passed,
        });
        self.publish(task, run, progress);
        Ok(result)
    }

    /// The review stage, which carries a verdict on top of the result.
    async fn review_stage(
        &self,
        task: &Task,
        run: &mut TaskRun,
        worktree: &crate::host::WorktreeHandle,
        progress: &mpsc::UnboundedSender<RunMetrics>,
    ) -> Result<ReviewOutcome, String> {
        self.events.emit(NexusEvent::StageEntered {
            task_id: task.id.clone(),
            stage: Stage::Review,
            iteration: run.iterations,
        });

        let timeout = self.config.review_timeout;
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            match with_deadline(self.clock.as_ref(), timeout, self.qa.review(task, worktree))
                .await
            {
                Some(Ok(Some(outcome))) => break outcome,
                Some(Ok(None)) => {
                    break ReviewOutcome {
                        verdict: ReviewVerdict::Approve,
                        result: StageResult::auto_pass(),
                        scope_too_large: false,
                    };
                }
                Some(Err(e)) => {
                    if attempt >= self.config.transient_retry_max {
                        return Err(format!("review stage failed: {e}"));
                    }
                    self.backoff(attempt).await;
                }
                None => {
                    if attempt >= self.config.transient_retry_max {
                        return Err(format!("review stage timed out after {timeout:?}"));
                    }
                    self.backoff(attempt).await;
                }
            }
        };

        let passed = outcome.verdict == ReviewVerdict::Approve;
        run.record_stage(Stage::Review, outcome.result.clone());
        self.events.emit(NexusEvent::StageCompleted {
            task_id: task.id.clone(),
            stage: Stage::Review,
            iteration: run.iterations,
            passed,
        });
        self.publish(task, run, progress);
        Ok(outcome)
    }

    // -- worktree ------------------------------------------------------------

    async fn acquire_worktree(
        &self,
        task: &Task,
    ) -> Result<crate::host::WorktreeHandle, String> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.worktrees.acquire(&task.id).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    if attempt >= self.config.transient_retry_max {
                        return Err(format!("failed to acquire worktree: {e}"));
                    }
                    self.backoff(attempt).await;
                }
            }
        }
    }

    /// Merge with one rebase-and-retry on conflict.
    async fn merge(
        &self,
        task: &Task,
        handle: &crate::host::WorktreeHandle,
    ) -> Result<MergeOutcome, String> {
        let first = self
            .worktrees
            .merge(handle)
            .await
            .map_err(|e| format!("merge failed: {e}"))?;

        match first {
            MergeOutcome::Merged { .. } => Ok(first),
            MergeOutcome::Conflicts { .. } => {
                tracing::warn!(task_id = %task.id, "merge conflicted, retrying against latest base");
                self.worktrees
                    .merge(handle)
                    .await
                    .map_err(|e| format!("merge retry failed: {e}"))
            }
        }
    }

    async fn release_worktree(&self, run: &mut TaskRun) {
        if let Some(handle) = run.worktree.clone() {
            if let Err(e) = self.worktrees.release(handle).await {
                tracing::warn!(task_id = %run.task_id, error = %e, "failed to release worktree");
            }
        }
    }

    // -- plumbing ------------------------------------------------------------

    fn escalate(
        &self,
        task: &Task,
        mut run: TaskRun,
        reason: EscalateReason,
        progress: &mpsc::UnboundedSender<RunMetrics>,
    ) -> IterateOutcome {
        tracing::warn!(task_id = %task.id, reason = %reason, "run escalating");
        run.seal(self.clock.now());
        self.publish(task, &run, progress);
        IterateOutcome::Escalated { run, reason }
    }

    fn publish(&self, task: &Task, run: &TaskRun, progress: &mpsc::UnboundedSender<RunMetrics>) {
        let _ = progress.send(run.metrics(task, self.clock.now()));
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.backoff_base;
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = rand::rng().random_range(0..=base.as_millis().max(1) as u64);
        self.clock
            .sleep(exp + Duration::from_millis(jitter_ms))
            .await;
    }
}

/// The first stage the current iteration still owes, in canonical order.
fn next_pending_stage(green: &[Stage]) -> IterState {
    for stage in Stage::ALL {
        if !green.contains(&stage) {
            return IterState::for_stage(stage);
        }
    }
    // All four stages green means review approved; merge.
    IterState::Merging
}
