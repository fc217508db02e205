//! `nexus simulate`: run a plan through the real coordinator against
//! simulated capabilities.
//!
//! Every agent step "touches" the task's declared files, QA stages
//! auto-pass, and merges always land, so the run exercises wave
//! scheduling, events, and checkpointing deterministically without
//! spawning a single real agent.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nexus_core::coordinator::{Capabilities, CoordinatorConfig, NexusCoordinator, PlanOutcome};
use nexus_core::escalate::EscalationPackage;
use nexus_core::event::NexusEvent;
use nexus_core::host::{
    AgentContext, AgentRunner, AgentStepResult, ContextProvider, HumanChannel, HumanDecision,
    MergeOutcome, NoopQa, RunnerError, SystemClock, TimeEstimator, WorktreeHandle,
    WorktreeProvider,
};
use nexus_core::plan::{KahnResolver, Task, TaskId, parse_plan_toml};

use crate::store::JsonFileStore;

/// Agent stand-in: reports the declared files touched and nothing else.
struct SimulatedAgent;

#[async_trait]
impl AgentRunner for SimulatedAgent {
    async fn run_agent(
        &self,
        task: &Task,
        _context: &AgentContext,
        _tools: &[&str],
        _worktree: &WorktreeHandle,
    ) -> Result<AgentStepResult, RunnerError> {
        tokio::task::yield_now().await;
        Ok(AgentStepResult {
            files_touched: task.files.clone(),
            requested_context: None,
            requested_replan: false,
            summary: format!("simulated step for {}", task.id),
        })
    }
}

struct SimulatedContext;

#[async_trait]
impl ContextProvider for SimulatedContext {
    async fn provide(&self, _task: &Task, query: &str) -> Result<String> {
        Ok(format!("(simulated context for {query:?})"))
    }
}

/// Worktrees that exist only as paths; merges always land.
struct SimulatedWorktrees;

#[async_trait]
impl WorktreeProvider for SimulatedWorktrees {
    async fn acquire(&self, task_id: &TaskId) -> Result<WorktreeHandle> {
        Ok(WorktreeHandle {
            task_id: task_id.clone(),
            path: std::env::temp_dir().join("nexus-sim").join(task_id.as_str()),
            branch: format!("nexus/sim/{task_id}"),
        })
    }

    async fn release(&self, _handle: WorktreeHandle) -> Result<()> {
        Ok(())
    }

    async fn merge(&self, _handle: &WorktreeHandle) -> Result<MergeOutcome> {
        Ok(MergeOutcome::Merged {
            commit: format!("sim-{}", Uuid::new_v4().simple()),
        })
    }

    async fn checkpoint(&self, tag: &str) -> Result<String> {
        Ok(format!("refs/tags/{tag}"))
    }
}

/// Simulations have no human on call; escalations stay parked.
struct NoHumans;

#[async_trait]
impl HumanChannel for NoHumans {
    async fn notify(&self, package: &EscalationPackage) -> Result<()> {
        println!("! escalation for {}: {}", package.task.id, package.reason);
        Ok(())
    }

    async fn await_decision(&self, _package_id: Uuid) -> Result<HumanDecision> {
        anyhow::bail!("no human channel in simulation mode")
    }
}

/// Estimates are taken at face value.
struct IdentityEstimator;

#[async_trait]
impl TimeEstimator for IdentityEstimator {
    async fn estimate(&self, task: &Task) -> Result<u32> {
        Ok(task.estimate_minutes)
    }
}

pub async fn run_simulation(
    file_path: &str,
    max_concurrent: usize,
    state_dir: &Path,
) -> Result<()> {
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read plan file: {file_path}"))?;
    let plan = parse_plan_toml(&content)
        .with_context(|| format!("failed to parse plan file: {file_path}"))?;

    let caps = Capabilities {
        agent: Arc::new(SimulatedAgent),
        context: Arc::new(SimulatedContext),
        qa: Arc::new(NoopQa),
        worktrees: Arc::new(SimulatedWorktrees),
        persistence: Arc::new(JsonFileStore::open(state_dir)?),
        human: Arc::new(NoHumans),
        clock: Arc::new(SystemClock),
        estimator: Arc::new(IdentityEstimator),
        resolver: Arc::new(KahnResolver),
    };

    let config = CoordinatorConfig {
        max_concurrent,
        ..CoordinatorConfig::default()
    };
    let mut coordinator = NexusCoordinator::new(config, caps);

    // Narrate the run from the event stream.
    let mut events = coordinator.events().subscribe();
    let narrator = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NexusEvent::TaskStarted { task_id } => println!("> {task_id} started"),
                NexusEvent::TaskCompleted { task_id } => println!("+ {task_id} completed"),
                NexusEvent::TaskAbandoned { task_id, reason } => {
                    println!("- {task_id} abandoned: {reason}");
                }
                NexusEvent::WaveCheckpointed {
                    checkpoint_id,
                    wave_size,
                } => println!("= wave of {wave_size} checkpointed ({checkpoint_id})"),
                NexusEvent::ReplanApplied {
                    task_id, action, ..
                } => println!("~ replanned {task_id}: {action}"),
                _ => {}
            }
        }
    });

    let task_count = plan.tasks.len();
    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await?;
    narrator.abort();

    println!();
    match outcome {
        PlanOutcome::Success => println!("Simulation complete: all {task_count} tasks merged."),
        PlanOutcome::Failed { abandoned, blocked } => println!(
            "Simulation finished with failures: {} abandoned, {} blocked.",
            abandoned.len(),
            blocked.len()
        ),
        PlanOutcome::Interrupted => println!("Simulation interrupted."),
    }
    Ok(())
}
