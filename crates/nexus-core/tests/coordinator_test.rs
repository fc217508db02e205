//! End-to-end tests for the coordinator: waves, checkpoints, replanning,
//! escalation, and resume.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use nexus_core::coordinator::{CoordinatorConfig, NexusCoordinator, PlanOutcome};
use nexus_core::escalate::EscalateReason;
use nexus_core::event::NexusEvent;
use nexus_core::host::{HumanDecision, PersistenceGateway};
use nexus_core::iterate::{Diagnostic, ReviewOutcome, ReviewVerdict, Stage, StageResult};
use nexus_core::plan::{Plan, TaskId, validate_plan};
use nexus_core::replan::{ReplannerConfig, TriggerConfig};

use nexus_test_utils::{ScriptedStep, TestHost, task, task_with_deps};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn coordinator(host: &TestHost) -> NexusCoordinator {
    coordinator_with(host, CoordinatorConfig {
        iterator: nexus_core::iterate::IteratorConfig {
            backoff_base: Duration::ZERO,
            ..Default::default()
        },
        ..Default::default()
    })
}

fn coordinator_with(host: &TestHost, config: CoordinatorConfig) -> NexusCoordinator {
    NexusCoordinator::new(config, host.capabilities())
}

fn drain(rx: &mut broadcast::Receiver<NexusEvent>) -> Vec<NexusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn test_failure(message: &str) -> StageResult {
    StageResult::fail(
        "tests failed",
        vec![Diagnostic {
            code: Some("assert".into()),
            message: message.into(),
            file: Some("src/add.test.ts".into()),
            line: Some(12),
        }],
    )
}

// ---------------------------------------------------------------------------
// Scenario 1: clean single-task plan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_single_task_plan_completes() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);
    let mut events = coordinator.events().subscribe();

    let plan = Plan::new("genesis", vec![task("T1", 10)]);
    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should succeed");

    assert_eq!(outcome, PlanOutcome::Success);
    assert_eq!(host.agent.invocation_count(), 1, "one iteration");
    // Pre-wave and post-wave checkpoints.
    assert_eq!(host.persistence.checkpoint_count(), 2);

    // The observable sequence matches the contract: task start, the four
    // stages, completion, the post-wave checkpoint, plan completion.
    let significant: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            NexusEvent::TaskStarted { .. } => Some("task_started".to_owned()),
            NexusEvent::StageCompleted { stage, passed, .. } => {
                Some(format!("stage:{stage}:{passed}"))
            }
            NexusEvent::TaskCompleted { .. } => Some("task_completed".to_owned()),
            NexusEvent::WaveCheckpointed { .. } => Some("wave_checkpointed".to_owned()),
            NexusEvent::PlanCompleted { success, .. } => Some(format!("plan_completed:{success}")),
            _ => None,
        })
        .collect();
    assert_eq!(
        significant,
        vec![
            "task_started",
            "stage:build:true",
            "stage:lint:true",
            "stage:test:true",
            "stage:review:true",
            "task_completed",
            "wave_checkpointed",
            "plan_completed:true",
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: lint failure self-heals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lint_failure_heals_and_the_plan_still_succeeds() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);

    let plan = Plan::new("genesis", vec![task("T1", 10)]);
    host.qa.push_result(
        &TaskId::new("T1"),
        Stage::Lint,
        StageResult::fail(
            "lint found problems",
            vec![Diagnostic::message("'fs' is defined but never used")],
        ),
    );

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should succeed");

    assert_eq!(outcome, PlanOutcome::Success);
    assert_eq!(host.agent.invocation_count(), 2, "healed on iteration two");
}

// ---------------------------------------------------------------------------
// Scenario 3: repeated failure reroutes once, then escalates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_failure_reroutes_then_escalates() {
    let host = TestHost::new();
    let config = CoordinatorConfig {
        iterator: nexus_core::iterate::IteratorConfig {
            backoff_base: Duration::ZERO,
            ..Default::default()
        },
        replanner: ReplannerConfig {
            triggers: TriggerConfig {
                // Keep IterationExceeded out of this scenario's way.
                iteration_soft_limit: 100,
                ..Default::default()
            },
            max_reroutes: 2,
        },
        ..Default::default()
    };
    let mut coordinator = coordinator_with(&host, config);
    let mut events = coordinator.events().subscribe();

    let t1 = TaskId::new("T1");
    let plan = Plan::new("genesis", vec![task("T1", 10), task("T2", 10)]);
    // The same diagnostic fingerprint, over and over.
    for _ in 0..30 {
        host.qa
            .push_result(&t1, Stage::Test, test_failure("expected 5, got 3"));
    }
    // The human gives up on the task once it escalates.
    host.human.push_decision(HumanDecision::Abandon);

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should settle");

    let PlanOutcome::Failed { abandoned, blocked } = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };
    assert_eq!(abandoned, vec![t1.clone()]);
    assert!(blocked.is_empty());

    // One open-package escalation with the recurring fingerprint, carrying
    // the rerouted run.
    let packages = host.human.notified_packages();
    assert!(!packages.is_empty());
    let package = packages.last().unwrap();
    assert_eq!(package.task.id, t1);
    assert!(
        matches!(package.reason, EscalateReason::RepeatedFailure { .. }),
        "got: {}",
        package.reason
    );
    let final_run = package.run_history.last().unwrap();
    assert!(final_run.reroutes >= 1, "a reroute was applied before escalating");

    // The independent wave-mate completed normally.
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        NexusEvent::TaskCompleted { task_id } if task_id.as_str() == "T2"
    )));
    assert!(events.iter().any(|e| matches!(e, NexusEvent::Escalated { .. })));
    // Wave checkpoint written even though one slot escalated.
    assert!(host.persistence.checkpoint_count() >= 2);
}

// ---------------------------------------------------------------------------
// Scenario 4: scope creep splits by file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scope_creep_splits_the_task_by_file() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);
    let mut events = coordinator.events().subscribe();

    let t1 = TaskId::new("T1");
    let mut parent = task("T1", 20);
    parent.files = vec!["src/a.ts".into()];
    let plan = Plan::new("genesis", vec![parent]);

    // The agent wanders across four files; one test failure bounces the
    // run back to a coding boundary where the split can land.
    host.agent.script(
        &t1,
        vec![ScriptedStep::touching(&[
            "src/a.ts",
            "src/b.ts",
            "src/c.ts",
            "src/d.ts",
        ])],
    );
    host.qa
        .push_result(&t1, Stage::Test, test_failure("b is not defined"));

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should succeed");

    assert_eq!(outcome, PlanOutcome::Success);

    let events = drain(&mut events);
    // The replan landed...
    assert!(events.iter().any(|e| matches!(
        e,
        NexusEvent::ReplanApplied { task_id, .. } if task_id.as_str() == "T1"
    )));
    // ...the parent is gone, and four children completed in its place.
    let completed: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            NexusEvent::TaskCompleted { task_id } => Some(task_id.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["T1a", "T1b", "T1c", "T1d"]);
    assert!(!completed.contains(&"T1".to_owned()));
}

// ---------------------------------------------------------------------------
// Scenario 6: resume from checkpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resuming_a_finished_checkpoint_terminates_immediately() {
    let host = TestHost::new();
    let mut first = coordinator(&host);

    let plan = Plan::new("genesis", vec![task("T1", 10)]);
    host.qa.push_result(
        &TaskId::new("T1"),
        Stage::Lint,
        StageResult::fail("lint", vec![Diagnostic::message("unused import")]),
    );
    let outcome = first
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("first run should succeed");
    assert_eq!(outcome, PlanOutcome::Success);

    let checkpoints = host
        .persistence
        .list_checkpoints()
        .await
        .expect("listing should work");
    let last = *checkpoints.last().expect("post-wave checkpoint exists");

    // A fresh coordinator over the same store, with a fresh agent that
    // must never be called.
    let mut resumed_host = TestHost::new();
    resumed_host.persistence = host.persistence.clone();
    let mut resumed = coordinator(&resumed_host);
    let mut events = resumed.events().subscribe();

    let outcome = resumed
        .resume_from_checkpoint(last, CancellationToken::new())
        .await
        .expect("resume should succeed");

    assert_eq!(outcome, PlanOutcome::Success);
    assert_eq!(resumed_host.agent.invocation_count(), 0, "no iterator activity");
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        NexusEvent::PlanCompleted { success: true, .. }
    )));
}

// ---------------------------------------------------------------------------
// Escalation decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn human_resume_requeues_the_task() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);
    let mut events = coordinator.events().subscribe();

    let t1 = TaskId::new("T1");
    let plan = Plan::new("genesis", vec![task("T1", 10)]);
    // First review rejects outright; the retry after resume approves.
    host.qa.push_review(
        &t1,
        ReviewOutcome {
            verdict: ReviewVerdict::Reject,
            result: StageResult::fail("not the right shape", vec![]),
            scope_too_large: false,
        },
    );
    host.human.push_decision(HumanDecision::Resume);

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should settle");

    assert_eq!(outcome, PlanOutcome::Success);
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, NexusEvent::Escalated { .. })));
    assert!(events.iter().any(|e| matches!(e, NexusEvent::Resumed { .. })));
    // The package closed when the decision was applied.
    assert_eq!(coordinator.escalation().open_count().await, 0);
}

#[tokio::test]
async fn human_abandon_cascades_to_dependents() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);
    let mut events = coordinator.events().subscribe();

    let t1 = TaskId::new("T1");
    let plan = Plan::new(
        "genesis",
        vec![
            task("T1", 10),
            task_with_deps("T2", 10, &["T1"]),
            task_with_deps("T3", 10, &["T2"]),
        ],
    );
    host.qa.push_review(
        &t1,
        ReviewOutcome {
            verdict: ReviewVerdict::Reject,
            result: StageResult::fail("out of scope", vec![]),
            scope_too_large: false,
        },
    );
    host.human.push_decision(HumanDecision::Abandon);

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should settle");

    let PlanOutcome::Failed { abandoned, .. } = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };
    assert_eq!(
        abandoned,
        vec![TaskId::new("T1"), TaskId::new("T2"), TaskId::new("T3")]
    );
    let abandoned_events = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, NexusEvent::TaskAbandoned { .. }))
        .count();
    assert_eq!(abandoned_events, 3);
}

// ---------------------------------------------------------------------------
// Agent-driven replanning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_replan_request_splits_by_functionality() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);
    let mut events = coordinator.events().subscribe();

    let t1 = TaskId::new("T1");
    let mut parent = task("T1", 10);
    parent.acceptance = "renders the summary; exports a csv".into();
    let plan = Plan::new("genesis", vec![parent]);
    host.agent.script(&t1, vec![ScriptedStep::requesting_replan()]);

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should succeed");

    assert_eq!(outcome, PlanOutcome::Success);
    let completed: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            NexusEvent::TaskCompleted { task_id } => Some(task_id.to_string()),
            _ => None,
        })
        .collect();
    // Independently testable sub-goals ran as sibling tasks.
    assert_eq!(completed.len(), 2);
    assert!(completed.contains(&"T1a".to_owned()));
    assert!(completed.contains(&"T1b".to_owned()));
}

// ---------------------------------------------------------------------------
// Waves and concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn waves_respect_the_dependency_order() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);
    let mut events = coordinator.events().subscribe();

    let plan = Plan::new(
        "diamond",
        vec![
            task("A", 5),
            task_with_deps("B", 5, &["A"]),
            task_with_deps("C", 5, &["A"]),
            task_with_deps("D", 5, &["B", "C"]),
        ],
    );
    validate_plan(&plan).expect("diamond is a DAG");

    let outcome = coordinator
        .run_plan(plan, CancellationToken::new())
        .await
        .expect("run should succeed");
    assert_eq!(outcome, PlanOutcome::Success);

    // A completes before B or C start; B and C complete before D starts.
    let events = drain(&mut events);
    let position = |pred: &dyn Fn(&NexusEvent) -> bool| {
        events.iter().position(|e| pred(e)).expect("event present")
    };
    let completed =
        |id: &'static str| move |e: &NexusEvent| matches!(e, NexusEvent::TaskCompleted { task_id } if task_id.as_str() == id);
    let started =
        |id: &'static str| move |e: &NexusEvent| matches!(e, NexusEvent::TaskStarted { task_id } if task_id.as_str() == id);

    assert!(position(&completed("A")) < position(&started("B")));
    assert!(position(&completed("A")) < position(&started("C")));
    assert!(position(&completed("B")) < position(&started("D")));
    assert!(position(&completed("C")) < position(&started("D")));
}

#[tokio::test]
async fn concurrency_stays_within_the_configured_limit() {
    let host = TestHost::new();
    let config = CoordinatorConfig {
        max_concurrent: 2,
        iterator: nexus_core::iterate::IteratorConfig {
            backoff_base: Duration::ZERO,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut coordinator = coordinator_with(&host, config);

    let tasks = (0..6).map(|i| task(&format!("T{i}"), 5)).collect();
    let outcome = coordinator
        .run_plan(Plan::new("fanout", tasks), CancellationToken::new())
        .await
        .expect("run should succeed");

    assert_eq!(outcome, PlanOutcome::Success);
    assert!(
        host.worktrees.max_live() <= 2,
        "observed {} concurrent worktrees",
        host.worktrees.max_live()
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pre_cancelled_run_interrupts_without_dispatch() {
    let host = TestHost::new();
    let mut coordinator = coordinator(&host);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = coordinator
        .run_plan(Plan::new("genesis", vec![task("T1", 10)]), cancel)
        .await
        .expect("run should settle");

    assert_eq!(outcome, PlanOutcome::Interrupted);
    assert_eq!(host.agent.invocation_count(), 0);
}
