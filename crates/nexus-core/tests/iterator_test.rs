//! Integration tests for the per-task iteration engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use nexus_core::escalate::EscalateReason;
use nexus_core::event::EventBus;
use nexus_core::host::MergeOutcome;
use nexus_core::iterate::{
    IterateOutcome, IteratorConfig, RalphStyleIterator, ReviewOutcome, ReviewVerdict, RunDirective,
    Stage, StageResult,
};
use nexus_core::iterate::Diagnostic;
use nexus_core::plan::Task;

use nexus_test_utils::{ScriptedStep, TestHost, request_changes, task};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    host: TestHost,
    iterator: RalphStyleIterator,
    events: EventBus,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: IteratorConfig) -> Self {
        let host = TestHost::new();
        let events = EventBus::default();
        let iterator = RalphStyleIterator::new(
            config,
            host.agent.clone(),
            host.context.clone(),
            host.qa.clone(),
            host.worktrees.clone(),
            host.clock.clone(),
            events.clone(),
        );
        Self {
            host,
            iterator,
            events,
        }
    }

    async fn run(&self, task: &Task) -> IterateOutcome {
        let (_dir_tx, mut dir_rx) = mpsc::unbounded_channel();
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        self.iterator.run(task, &mut dir_rx, &progress_tx).await
    }
}

fn test_config() -> IteratorConfig {
    IteratorConfig {
        // Zero backoff keeps retries instant under the manual clock.
        backoff_base: Duration::ZERO,
        ..IteratorConfig::default()
    }
}

fn lint_failure(message: &str) -> StageResult {
    StageResult::fail(
        "lint found problems",
        vec![Diagnostic {
            code: Some("no-unused-vars".into()),
            message: message.into(),
            file: Some("src/add.ts".into()),
            line: Some(1),
        }],
    )
}

// ---------------------------------------------------------------------------
// Happy path and self-healing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_task_merges_in_one_iteration() {
    let harness = Harness::new();
    let task = task("T1", 10);

    let outcome = harness.run(&task).await;

    let IterateOutcome::Done { run } = outcome else {
        panic!("expected Done, got {outcome:?}");
    };
    assert_eq!(run.iterations, 1);
    assert_eq!(run.stage_history.len(), 4, "build, lint, test, review");
    assert!(run.stage_history.iter().all(|r| r.result.passed));
    assert!(run.sealed_at.is_some());

    // Worktree handed back after the merge.
    assert_eq!(
        harness.host.worktrees.released.lock().unwrap().as_slice(),
        &[task.id.clone()]
    );
    assert_eq!(harness.host.worktrees.merge_attempts(&task.id), 1);
}

#[tokio::test]
async fn lint_failure_self_heals_on_the_second_iteration() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness
        .host
        .qa
        .push_result(&task.id, Stage::Lint, lint_failure("'fs' is defined but never used"));

    let outcome = harness.run(&task).await;

    let IterateOutcome::Done { run } = outcome else {
        panic!("expected Done, got {outcome:?}");
    };
    assert_eq!(run.iterations, 2);
    // Iteration 1: build pass, lint fail. Iteration 2 modified the file
    // again, so QA restarts from the build: build, lint, test, review.
    let stages: Vec<(u32, Stage, bool)> = run
        .stage_history
        .iter()
        .map(|r| (r.iteration, r.stage, r.result.passed))
        .collect();
    assert_eq!(
        stages,
        vec![
            (1, Stage::Build, true),
            (1, Stage::Lint, false),
            (2, Stage::Build, true),
            (2, Stage::Lint, true),
            (2, Stage::Test, true),
            (2, Stage::Review, true),
        ]
    );

    // The second coding pass saw the lint diagnostic.
    assert_eq!(harness.host.agent.invocation_count(), 2);
}

#[tokio::test]
async fn zero_touch_fix_resumes_at_the_failed_stage() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness
        .host
        .qa
        .push_review(&task.id, request_changes("tighten the acceptance check"));
    // The follow-up step touches nothing, so build/lint/test stay green.
    harness
        .host
        .agent
        .script(&task.id, vec![ScriptedStep::ok(), ScriptedStep::touching(&[])]);

    let outcome = harness.run(&task).await;

    let IterateOutcome::Done { run } = outcome else {
        panic!("expected Done, got {outcome:?}");
    };
    assert_eq!(run.iterations, 2);
    let stages: Vec<(Stage, bool)> = run
        .stage_history
        .iter()
        .map(|r| (r.stage, r.result.passed))
        .collect();
    assert_eq!(
        stages,
        vec![
            (Stage::Build, true),
            (Stage::Lint, true),
            (Stage::Test, true),
            (Stage::Review, false),
            (Stage::Review, true),
        ]
    );
}

// ---------------------------------------------------------------------------
// Caps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn iteration_cap_escalates_without_another_coding_attempt() {
    let harness = Harness::new();
    let task = task("T1", 10);
    for _ in 0..50 {
        harness
            .host
            .qa
            .push_result(&task.id, Stage::Lint, lint_failure("unused import"));
    }

    let outcome = harness.run(&task).await;

    let IterateOutcome::Escalated { run, reason } = outcome else {
        panic!("expected Escalated, got {outcome:?}");
    };
    assert!(matches!(reason, EscalateReason::IterationCap { .. }), "got: {reason}");
    assert_eq!(run.iterations, 50);
    // Exactly 50 coding attempts; no 51st after the cap.
    assert_eq!(harness.host.agent.invocation_count(), 50);
}

#[tokio::test]
async fn wall_clock_cap_escalates() {
    // A zero cap trips on the first boundary check, before any coding.
    let harness = Harness::with_config(IteratorConfig {
        wall_clock_cap: Duration::ZERO,
        backoff_base: Duration::ZERO,
        ..IteratorConfig::default()
    });
    let task = task("T1", 10);

    let outcome = harness.run(&task).await;
    let IterateOutcome::Escalated { reason, .. } = outcome else {
        panic!("expected Escalated, got {outcome:?}");
    };
    assert!(matches!(reason, EscalateReason::WallClockCap { .. }), "got: {reason}");
    assert_eq!(harness.host.agent.invocation_count(), 0);
}

// ---------------------------------------------------------------------------
// Agent contract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn context_requests_stay_within_one_iteration() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.agent.script(
        &task.id,
        vec![
            ScriptedStep::requesting_context("what does the caller expect?"),
            ScriptedStep::ok(),
        ],
    );

    let outcome = harness.run(&task).await;

    let IterateOutcome::Done { run } = outcome else {
        panic!("expected Done, got {outcome:?}");
    };
    assert_eq!(run.iterations, 1, "context fetch is not a new iteration");
    assert_eq!(harness.host.agent.invocation_count(), 2);
    assert_eq!(
        harness.host.context.queries.lock().unwrap().as_slice(),
        &["what does the caller expect?".to_owned()]
    );
}

#[tokio::test]
async fn replan_request_suspends_the_run() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness
        .host
        .agent
        .script(&task.id, vec![ScriptedStep::requesting_replan()]);

    let outcome = harness.run(&task).await;
    let IterateOutcome::ReplanRequested { run } = outcome else {
        panic!("expected ReplanRequested, got {outcome:?}");
    };
    assert!(run.replan_requested);
}

#[tokio::test]
async fn misbehavior_gets_one_strict_retry() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.agent.script(
        &task.id,
        vec![ScriptedStep::misbehaving("wrote outside the worktree"), ScriptedStep::ok()],
    );

    let outcome = harness.run(&task).await;

    assert!(matches!(outcome, IterateOutcome::Done { .. }), "got {outcome:?}");
    let invocations = harness.host.agent.invocations();
    assert_eq!(invocations.len(), 2);
    assert!(!invocations[0].2, "first attempt is not strict");
    assert!(invocations[1].2, "corrective retry is strict");
}

#[tokio::test]
async fn transient_agent_errors_retry_then_escalate() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.agent.script(
        &task.id,
        vec![
            ScriptedStep::transient("api timeout"),
            ScriptedStep::transient("api timeout"),
            ScriptedStep::transient("api timeout"),
        ],
    );

    let outcome = harness.run(&task).await;
    let IterateOutcome::Escalated { reason, .. } = outcome else {
        panic!("expected Escalated, got {outcome:?}");
    };
    assert!(matches!(reason, EscalateReason::ToolFailure { .. }), "got: {reason}");
    assert_eq!(harness.host.agent.invocation_count(), 3, "three attempts, no more");
}

#[tokio::test]
async fn transient_agent_errors_recover_within_the_budget() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.agent.script(
        &task.id,
        vec![ScriptedStep::transient("api timeout"), ScriptedStep::ok()],
    );

    let outcome = harness.run(&task).await;
    assert!(matches!(outcome, IterateOutcome::Done { .. }), "got {outcome:?}");
}

// ---------------------------------------------------------------------------
// Review and merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_reject_escalates_immediately() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.qa.push_review(
        &task.id,
        ReviewOutcome {
            verdict: ReviewVerdict::Reject,
            result: StageResult::fail("wrong direction entirely", vec![]),
            scope_too_large: false,
        },
    );

    let outcome = harness.run(&task).await;
    let IterateOutcome::Escalated { reason, .. } = outcome else {
        panic!("expected Escalated, got {outcome:?}");
    };
    assert!(matches!(reason, EscalateReason::ReviewRejected { .. }), "got: {reason}");
}

#[tokio::test]
async fn merge_conflict_retries_once_then_escalates() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.worktrees.script_merge(
        &task.id,
        vec![
            MergeOutcome::Conflicts {
                report: "both modified src/add.ts".into(),
            },
            MergeOutcome::Conflicts {
                report: "both modified src/add.ts".into(),
            },
        ],
    );

    let outcome = harness.run(&task).await;
    let IterateOutcome::Escalated { reason, .. } = outcome else {
        panic!("expected Escalated, got {outcome:?}");
    };
    assert!(matches!(reason, EscalateReason::MergeConflict { .. }), "got: {reason}");
    assert_eq!(harness.host.worktrees.merge_attempts(&task.id), 2);
}

#[tokio::test]
async fn merge_conflict_recovers_on_the_retry() {
    let harness = Harness::new();
    let task = task("T1", 10);
    harness.host.worktrees.script_merge(
        &task.id,
        vec![
            MergeOutcome::Conflicts {
                report: "stale base".into(),
            },
            MergeOutcome::Merged {
                commit: "abc123".into(),
            },
        ],
    );

    let outcome = harness.run(&task).await;
    assert!(matches!(outcome, IterateOutcome::Done { .. }), "got {outcome:?}");
    assert_eq!(harness.host.worktrees.merge_attempts(&task.id), 2);
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

#[tokio::test]
async fn suspend_directive_stops_at_the_iteration_boundary() {
    let harness = Harness::new();
    let task = task("T1", 10);

    let (dir_tx, mut dir_rx) = mpsc::unbounded_channel();
    dir_tx.send(RunDirective::Suspend).unwrap();
    let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

    let outcome = harness.iterator.run(&task, &mut dir_rx, &progress_tx).await;
    let IterateOutcome::Suspended { run } = outcome else {
        panic!("expected Suspended, got {outcome:?}");
    };
    assert_eq!(run.iterations, 0, "suspended before the first coding pass");
    assert_eq!(harness.host.agent.invocation_count(), 0);
}

#[tokio::test]
async fn reroute_directive_lands_in_the_next_iteration() {
    let harness = Harness::new();
    let task = task("T1", 10);

    let (dir_tx, mut dir_rx) = mpsc::unbounded_channel();
    dir_tx
        .send(RunDirective::Reroute {
            hint: "try the streaming api instead".into(),
        })
        .unwrap();
    let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

    let outcome = harness.iterator.run(&task, &mut dir_rx, &progress_tx).await;
    let IterateOutcome::Done { run } = outcome else {
        panic!("expected Done, got {outcome:?}");
    };
    assert_eq!(run.reroutes, 1);
    assert_eq!(run.reroute_hints, vec!["try the streaming api instead".to_owned()]);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stage_events_are_ordered_per_task() {
    let harness = Harness::new();
    let task = task("T1", 10);
    let mut rx = harness.events.subscribe();

    let outcome = harness.run(&task).await;
    assert!(matches!(outcome, IterateOutcome::Done { .. }));

    use nexus_core::event::NexusEvent;
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match event {
            NexusEvent::TaskStarted { .. } => "started".to_owned(),
            NexusEvent::IterationAdvanced { iteration, .. } => format!("iter{iteration}"),
            NexusEvent::StageEntered { stage, .. } => format!("enter:{stage}"),
            NexusEvent::StageCompleted { stage, passed, .. } => {
                format!("done:{stage}:{passed}")
            }
            other => format!("{other:?}"),
        });
    }
    assert_eq!(
        kinds,
        vec![
            "started",
            "iter1",
            "enter:build",
            "done:build:true",
            "enter:lint",
            "done:lint:true",
            "enter:test",
            "done:test:true",
            "enter:review",
            "done:review:true",
        ]
    );
}
