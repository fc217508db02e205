//! Shared fakes for nexus integration tests.
//!
//! Every capability the coordinator consumes has an in-memory, scriptable
//! stand-in here: a manually driven clock, a scripted agent, scripted QA
//! callbacks, in-memory worktrees and checkpoint storage, and a queued
//! human channel. [`TestHost`] bundles them into a ready
//! [`Capabilities`] value.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use nexus_core::checkpoint::Checkpoint;
use nexus_core::coordinator::Capabilities;
use nexus_core::escalate::EscalationPackage;
use nexus_core::host::{
    AgentContext, AgentRunner, AgentStepResult, Clock, ContextProvider, Decomposer, HumanChannel,
    HumanDecision, MergeOutcome, PersistenceGateway, PlanSource, QaRunner, RunnerError,
    TimeEstimator, WorktreeHandle, WorktreeProvider,
};
use nexus_core::iterate::{ReviewOutcome, ReviewVerdict, Stage, StageResult};
use nexus_core::plan::{KahnResolver, Plan, Task, TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// A clock that only moves when the test says so.
///
/// `sleep` parks the caller until `advance` pushes time past its deadline,
/// so timeouts and wall-clock caps are fully deterministic.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    notify: Notify,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            notify: Notify::new(),
        }
    }

    /// Move time forward and wake every parked sleeper.
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(duration).expect("advance fits chrono range");
        }
        self.notify.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + chrono::Duration::from_std(duration).unwrap_or_default();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.now() >= deadline {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One scripted agent step.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStep {
    /// Files the step reports touching; `None` touches the task's declared
    /// files.
    pub files: Option<Vec<String>>,
    pub request_context: Option<String>,
    pub request_replan: bool,
    /// Fail transiently instead of producing a result.
    pub transient_error: Option<String>,
    /// Misbehave instead of producing a result.
    pub misbehavior: Option<String>,
}

impl ScriptedStep {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn touching(files: &[&str]) -> Self {
        Self {
            files: Some(files.iter().map(|s| (*s).to_owned()).collect()),
            ..Self::default()
        }
    }

    pub fn requesting_context(query: &str) -> Self {
        Self {
            request_context: Some(query.to_owned()),
            ..Self::default()
        }
    }

    pub fn requesting_replan() -> Self {
        Self {
            request_replan: true,
            ..Self::default()
        }
    }

    pub fn transient(detail: &str) -> Self {
        Self {
            transient_error: Some(detail.to_owned()),
            ..Self::default()
        }
    }

    pub fn misbehaving(detail: &str) -> Self {
        Self {
            misbehavior: Some(detail.to_owned()),
            ..Self::default()
        }
    }
}

/// Agent runner that replays scripted steps per task; once the script is
/// exhausted it reports the task's declared files touched.
#[derive(Default)]
pub struct ScriptedAgentRunner {
    scripts: Mutex<HashMap<TaskId, VecDeque<ScriptedStep>>>,
    invocations: Mutex<Vec<(TaskId, u32, bool)>>,
}

impl ScriptedAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, task_id: &TaskId, steps: Vec<ScriptedStep>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .extend(steps);
    }

    /// `(task, iteration, strict)` per invocation, in order.
    pub fn invocations(&self) -> Vec<(TaskId, u32, bool)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgentRunner {
    async fn run_agent(
        &self,
        task: &Task,
        context: &AgentContext,
        _tools: &[&str],
        _worktree: &WorktreeHandle,
    ) -> Result<AgentStepResult, RunnerError> {
        // Real agent calls suspend; without this the whole run would spin
        // to completion before the coordinator observes anything.
        tokio::task::yield_now().await;
        self.invocations
            .lock()
            .unwrap()
            .push((task.id.clone(), context.iteration, context.strict));

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        if let Some(detail) = step.transient_error {
            return Err(RunnerError::Transient(detail));
        }
        if let Some(detail) = step.misbehavior {
            return Err(RunnerError::Misbehavior(detail));
        }

        Ok(AgentStepResult {
            files_touched: step.files.unwrap_or_else(|| task.files.clone()),
            requested_context: step.request_context,
            requested_replan: step.request_replan,
            summary: "scripted step".to_owned(),
        })
    }
}

/// Context provider returning a canned answer and remembering queries.
#[derive(Default)]
pub struct CannedContext {
    pub queries: Mutex<Vec<String>>,
}

#[async_trait]
impl ContextProvider for CannedContext {
    async fn provide(&self, _task: &Task, query: &str) -> Result<String> {
        self.queries.lock().unwrap().push(query.to_owned());
        Ok(format!("context for {query:?}"))
    }
}

// ---------------------------------------------------------------------------
// QA
// ---------------------------------------------------------------------------

/// QA runner replaying scripted stage results; exhausted scripts pass.
#[derive(Default)]
pub struct ScriptedQa {
    results: Mutex<HashMap<(TaskId, Stage), VecDeque<StageResult>>>,
    reviews: Mutex<HashMap<TaskId, VecDeque<ReviewOutcome>>>,
}

impl ScriptedQa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, task_id: &TaskId, stage: Stage, result: StageResult) {
        self.results
            .lock()
            .unwrap()
            .entry((task_id.clone(), stage))
            .or_default()
            .push_back(result);
    }

    pub fn push_review(&self, task_id: &TaskId, outcome: ReviewOutcome) {
        self.reviews
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .push_back(outcome);
    }

    fn pop(&self, task_id: &TaskId, stage: Stage) -> StageResult {
        self.results
            .lock()
            .unwrap()
            .get_mut(&(task_id.clone(), stage))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| StageResult::pass(format!("{stage} ok")))
    }
}

#[async_trait]
impl QaRunner for ScriptedQa {
    async fn build(&self, task: &Task, _worktree: &WorktreeHandle) -> Result<Option<StageResult>> {
        tokio::task::yield_now().await;
        Ok(Some(self.pop(&task.id, Stage::Build)))
    }

    async fn lint(&self, task: &Task, _worktree: &WorktreeHandle) -> Result<Option<StageResult>> {
        tokio::task::yield_now().await;
        Ok(Some(self.pop(&task.id, Stage::Lint)))
    }

    async fn test(&self, task: &Task, _worktree: &WorktreeHandle) -> Result<Option<StageResult>> {
        tokio::task::yield_now().await;
        Ok(Some(self.pop(&task.id, Stage::Test)))
    }

    async fn review(
        &self,
        task: &Task,
        _worktree: &WorktreeHandle,
    ) -> Result<Option<ReviewOutcome>> {
        tokio::task::yield_now().await;
        let scripted = self
            .reviews
            .lock()
            .unwrap()
            .get_mut(&task.id)
            .and_then(VecDeque::pop_front);
        Ok(Some(scripted.unwrap_or(ReviewOutcome {
            verdict: ReviewVerdict::Approve,
            result: StageResult::pass("review ok"),
            scope_too_large: false,
        })))
    }
}

/// A review outcome requesting changes with one diagnostic message.
pub fn request_changes(message: &str) -> ReviewOutcome {
    ReviewOutcome {
        verdict: ReviewVerdict::RequestChanges,
        result: StageResult::fail(
            "changes requested",
            vec![nexus_core::iterate::Diagnostic::message(message)],
        ),
        scope_too_large: false,
    }
}

// ---------------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------------

/// In-memory worktree provider: fabricated handles, scripted merges,
/// recorded checkpoints and releases.
#[derive(Default)]
pub struct MemoryWorktrees {
    merge_outcomes: Mutex<HashMap<TaskId, VecDeque<MergeOutcome>>>,
    pub released: Mutex<Vec<TaskId>>,
    pub checkpoints: Mutex<Vec<String>>,
    merges: Mutex<Vec<TaskId>>,
    live: Mutex<(usize, usize)>,
}

impl MemoryWorktrees {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_merge(&self, task_id: &TaskId, outcomes: Vec<MergeOutcome>) {
        self.merge_outcomes
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .extend(outcomes);
    }

    pub fn merge_attempts(&self, task_id: &TaskId) -> usize {
        self.merges
            .lock()
            .unwrap()
            .iter()
            .filter(|t| *t == task_id)
            .count()
    }

    pub fn checkpoint_tags(&self) -> Vec<String> {
        self.checkpoints.lock().unwrap().clone()
    }

    /// Most worktrees held at once; proxies observed concurrency.
    pub fn max_live(&self) -> usize {
        self.live.lock().unwrap().1
    }
}

#[async_trait]
impl WorktreeProvider for MemoryWorktrees {
    async fn acquire(&self, task_id: &TaskId) -> Result<WorktreeHandle> {
        tokio::task::yield_now().await;
        {
            let mut live = self.live.lock().unwrap();
            live.0 += 1;
            live.1 = live.1.max(live.0);
        }
        Ok(WorktreeHandle {
            task_id: task_id.clone(),
            path: format!("/tmp/nexus-worktrees/{task_id}").into(),
            branch: format!("nexus/{task_id}"),
        })
    }

    async fn release(&self, handle: WorktreeHandle) -> Result<()> {
        {
            let mut live = self.live.lock().unwrap();
            live.0 = live.0.saturating_sub(1);
        }
        self.released.lock().unwrap().push(handle.task_id);
        Ok(())
    }

    async fn merge(&self, handle: &WorktreeHandle) -> Result<MergeOutcome> {
        tokio::task::yield_now().await;
        self.merges.lock().unwrap().push(handle.task_id.clone());
        let scripted = self
            .merge_outcomes
            .lock()
            .unwrap()
            .get_mut(&handle.task_id)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or(MergeOutcome::Merged {
            commit: format!("commit-{}", Uuid::new_v4().simple()),
        }))
    }

    async fn checkpoint(&self, tag: &str) -> Result<String> {
        self.checkpoints.lock().unwrap().push(tag.to_owned());
        Ok(format!("refs/tags/{tag}"))
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Checkpoint store that serializes through JSON, so storage exercises the
/// same round-trip a file-backed gateway would.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<(Uuid, String)>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryPersistence {
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)?;
        self.records.lock().unwrap().push((checkpoint.id, json));
        Ok(())
    }

    async fn read_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>> {
        let records = self.records.lock().unwrap();
        let Some((_, json)) = records.iter().find(|(cp_id, _)| *cp_id == id) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(json)?))
    }

    async fn list_checkpoints(&self) -> Result<Vec<Uuid>> {
        Ok(self.records.lock().unwrap().iter().map(|(id, _)| *id).collect())
    }
}

// ---------------------------------------------------------------------------
// Humans
// ---------------------------------------------------------------------------

/// Human channel fed from a queue of pre-loaded decisions.
///
/// `await_decision` pops the next decision, or parks until one is pushed.
#[derive(Default)]
pub struct QueuedHumanChannel {
    pub notifications: Mutex<Vec<EscalationPackage>>,
    decisions: Mutex<VecDeque<HumanDecision>>,
    notify: Notify,
}

impl QueuedHumanChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_decision(&self, decision: HumanDecision) {
        self.decisions.lock().unwrap().push_back(decision);
        self.notify.notify_waiters();
    }

    pub fn notified_packages(&self) -> Vec<EscalationPackage> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanChannel for QueuedHumanChannel {
    async fn notify(&self, package: &EscalationPackage) -> Result<()> {
        self.notifications.lock().unwrap().push(package.clone());
        Ok(())
    }

    async fn await_decision(&self, _package_id: Uuid) -> Result<HumanDecision> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(decision) = self.decisions.lock().unwrap().pop_front() {
                return Ok(decision);
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Estimation & decomposition
// ---------------------------------------------------------------------------

/// Estimator returning one fixed value.
pub struct FixedEstimator(pub u32);

#[async_trait]
impl TimeEstimator for FixedEstimator {
    async fn estimate(&self, _task: &Task) -> Result<u32> {
        Ok(self.0)
    }
}

/// Decomposer returning one pre-built plan regardless of source.
pub struct FixedDecomposer(pub Plan);

#[async_trait]
impl Decomposer for FixedDecomposer {
    async fn decompose(&self, _source: &PlanSource) -> Result<Plan> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Builders & bundles
// ---------------------------------------------------------------------------

/// A pending task with sensible test defaults.
pub fn task(id: &str, estimate_minutes: u32) -> Task {
    let mut t = Task::new(id, format!("task {id}"));
    t.description = format!("Test task {id}.");
    t.estimate_minutes = estimate_minutes;
    t.files = vec![format!("src/{id}.ts")];
    t.acceptance = format!("{id} acceptance holds");
    t.status = TaskStatus::Pending;
    t
}

/// `task` with dependencies.
pub fn task_with_deps(id: &str, estimate_minutes: u32, deps: &[&str]) -> Task {
    let mut t = task(id, estimate_minutes);
    t.depends_on = deps.iter().map(|d| TaskId::new(*d)).collect();
    t
}

/// The full fake capability bundle, with typed handles to every fake so
/// tests can script and inspect them.
pub struct TestHost {
    pub agent: std::sync::Arc<ScriptedAgentRunner>,
    pub context: std::sync::Arc<CannedContext>,
    pub qa: std::sync::Arc<ScriptedQa>,
    pub worktrees: std::sync::Arc<MemoryWorktrees>,
    pub persistence: std::sync::Arc<MemoryPersistence>,
    pub human: std::sync::Arc<QueuedHumanChannel>,
    pub clock: std::sync::Arc<ManualClock>,
    pub estimator: std::sync::Arc<FixedEstimator>,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            agent: std::sync::Arc::new(ScriptedAgentRunner::new()),
            context: std::sync::Arc::new(CannedContext::default()),
            qa: std::sync::Arc::new(ScriptedQa::new()),
            worktrees: std::sync::Arc::new(MemoryWorktrees::new()),
            persistence: std::sync::Arc::new(MemoryPersistence::new()),
            human: std::sync::Arc::new(QueuedHumanChannel::new()),
            clock: std::sync::Arc::new(ManualClock::new()),
            estimator: std::sync::Arc::new(FixedEstimator(10)),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            agent: self.agent.clone(),
            context: self.context.clone(),
            qa: self.qa.clone(),
            worktrees: self.worktrees.clone(),
            persistence: self.persistence.clone(),
            human: self.human.clone(),
            clock: self.clock.clone(),
            estimator: self.estimator.clone(),
            resolver: std::sync::Arc::new(KahnResolver),
        }
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}
