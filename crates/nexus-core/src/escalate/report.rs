//! Markdown rendering for escalation packages.

use crate::iterate::run::TaskRun;
use crate::plan::Task;
use crate::replan::DecisionRecord;

use super::EscalateReason;

/// How many trailing diagnostics the report shows.
const DIAGNOSTIC_LIMIT: usize = 10;

/// Render the human-facing report for an escalation.
pub fn render_report(
    task: &Task,
    runs: &[TaskRun],
    reason: &EscalateReason,
    decisions: &[&DecisionRecord],
    git_ref: &str,
) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Escalation: {} ({})\n\n", task.name, task.id));
    out.push_str(&format!("**Reason:** {reason}\n\n"));
    out.push_str(&format!("**Checkpoint ref:** `{git_ref}`\n\n"));

    out.push_str("## Task\n\n");
    out.push_str(&format!("{}\n\n", task.description.trim()));
    if !task.acceptance.is_empty() {
        out.push_str(&format!("Acceptance: {}\n\n", task.acceptance.trim()));
    }
    if !task.files.is_empty() {
        out.push_str(&format!("Declared files: {}\n\n", task.files.join(", ")));
    }

    if let Some(run) = runs.last() {
        out.push_str("## Last run\n\n");
        out.push_str(&format!(
            "- iterations: {}\n- stages executed: {}\n- files touched: {}\n\n",
            run.iterations,
            run.stage_history.len(),
            run.touched_files.len(),
        ));

        let diagnostics = run.last_diagnostics(DIAGNOSTIC_LIMIT);
        if !diagnostics.is_empty() {
            out.push_str("### Recent diagnostics\n\n");
            for d in &diagnostics {
                out.push_str(&format!("- {d}\n"));
            }
            out.push('\n');
        }
    }

    if !decisions.is_empty() {
        out.push_str("## Replan history\n\n");
        for record in decisions {
            out.push_str(&format!(
                "- {} `{}` {} ({})\n",
                record.at.format("%Y-%m-%d %H:%M:%S"),
                record.decision.action,
                record.decision.rationale,
                if record.applied { "applied" } else { "rejected" },
            ));
        }
        out.push('\n');
    }

    out.push_str("## Suggested next actions\n\n");
    for action in suggested_actions(reason) {
        out.push_str(&format!("- {action}\n"));
    }

    out
}

fn suggested_actions(reason: &EscalateReason) -> Vec<&'static str> {
    match reason {
        EscalateReason::IterationCap { .. } => vec![
            "Reassign with a split strategy to shrink the task",
            "Abandon if the approach is fundamentally wrong",
        ],
        EscalateReason::WallClockCap { .. } => vec![
            "Reassign with by_time to break the task into shorter slices",
            "Resume if the slowness was environmental",
        ],
        EscalateReason::RepeatedFailure { .. } => vec![
            "Inspect the recurring diagnostic and fix the underlying issue by hand",
            "Reassign with by_functionality to isolate the failing sub-goal",
        ],
        EscalateReason::ReviewRejected { .. } => vec![
            "Read the review verdict and decide whether the task is still worth pursuing",
            "Abandon if the reviewer's objection stands",
        ],
        EscalateReason::MergeConflict { .. } => vec![
            "Resolve the conflict in the checkpoint branch and resume",
        ],
        EscalateReason::ToolFailure { .. } => vec![
            "Check toolchain/network health, then resume",
        ],
        EscalateReason::ReplanRejected { .. } => vec![
            "The automatic replan would have broken the plan; restructure by hand and resume",
        ],
        EscalateReason::ReplanEscalation { .. } => vec![
            "Automatic corrections ran out; reassign with a split strategy or abandon",
        ],
    }
}
