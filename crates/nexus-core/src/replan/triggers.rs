//! Trigger evaluators: pure predicates over a task and its run metrics.
//!
//! Called in a fixed order on every observation tick; the first evaluator
//! that fires wins for that task on that tick. Evaluators never mutate
//! state -- re-arming and dedup live in the replanner.

use crate::plan::Task;
use crate::split::SplitStrategy;

use super::signal::{ReplanSignal, RunMetrics, SignalKind, SuggestedAction};

/// Thresholds for the trigger evaluators.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// TimeExceeded fires when elapsed > estimate * this factor.
    pub time_factor: f64,
    /// IterationExceeded fires above this many iterations.
    pub iteration_soft_limit: u32,
    /// Stage failures back-to-back that turn IterationExceeded into an
    /// escalation suggestion.
    pub consecutive_failure_limit: u32,
    /// ScopeCreep fires at this many undeclared files...
    pub scope_extra_files: usize,
    /// ...or when undeclared files exceed this fraction of the declared
    /// set.
    pub scope_extra_ratio: f64,
    /// RepeatedFailure fires when a fingerprint recurs this often.
    pub repeat_threshold: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            time_factor: 1.5,
            iteration_soft_limit: 10,
            consecutive_failure_limit: 3,
            scope_extra_files: 3,
            scope_extra_ratio: 0.5,
            repeat_threshold: 3,
        }
    }
}

/// Run all evaluators in canonical order; first match wins.
pub fn evaluate_all(
    task: &Task,
    metrics: &RunMetrics,
    config: &TriggerConfig,
) -> Option<ReplanSignal> {
    time_exceeded(task, metrics, config)
        .or_else(|| iteration_exceeded(task, metrics, config))
        .or_else(|| scope_creep(task, metrics, config))
        .or_else(|| repeated_failure(task, metrics, config))
        .or_else(|| unexpected_complexity(task, metrics, config))
}

/// Elapsed wall-clock exceeded the estimate by the configured factor.
pub fn time_exceeded(
    task: &Task,
    metrics: &RunMetrics,
    config: &TriggerConfig,
) -> Option<ReplanSignal> {
    let threshold = f64::from(task.estimate_minutes) * config.time_factor;
    if metrics.elapsed_minutes <= threshold {
        return None;
    }
    Some(ReplanSignal {
        kind: SignalKind::TimeExceeded,
        task_id: task.id.clone(),
        observed: format!("{:.1} min elapsed", metrics.elapsed_minutes),
        threshold: format!(
            "{} min estimate x {:.1}",
            task.estimate_minutes, config.time_factor
        ),
        suggested: SuggestedAction::Split(SplitStrategy::ByTime),
    })
}

/// Iteration count passed the soft limit. Suggests escalation when the
/// same stage keeps failing back-to-back, a re-estimate otherwise.
pub fn iteration_exceeded(
    task: &Task,
    metrics: &RunMetrics,
    config: &TriggerConfig,
) -> Option<ReplanSignal> {
    if metrics.iterations <= config.iteration_soft_limit {
        return None;
    }
    let stuck = metrics.consecutive_same_stage_failures >= config.consecutive_failure_limit;
    Some(ReplanSignal {
        kind: SignalKind::IterationExceeded,
        task_id: task.id.clone(),
        observed: format!("{} iterations", metrics.iterations),
        threshold: format!("soft limit {}", config.iteration_soft_limit),
        suggested: if stuck {
            SuggestedAction::Escalate
        } else {
            SuggestedAction::ReEstimate
        },
    })
}

/// The touched file set grew past the declared one. Never fires for tasks
/// that declared no files at all.
pub fn scope_creep(
    task: &Task,
    metrics: &RunMetrics,
    config: &TriggerConfig,
) -> Option<ReplanSignal> {
    let declared = metrics.declared_files.len();
    if declared == 0 {
        return None;
    }
    let extra = metrics.undeclared_files().len();
    let ratio = extra as f64 / declared as f64;
    if extra < config.scope_extra_files && ratio < config.scope_extra_ratio {
        return None;
    }
    Some(ReplanSignal {
        kind: SignalKind::ScopeCreep,
        task_id: task.id.clone(),
        observed: format!("{extra} undeclared files over {declared} declared"),
        threshold: format!(
            ">= {} files or >= {:.0}%",
            config.scope_extra_files,
            config.scope_extra_ratio * 100.0
        ),
        suggested: SuggestedAction::Split(SplitStrategy::ByFile),
    })
}

/// The same diagnostic fingerprint keeps coming back. Suggests a reroute
/// for a first offense and escalation once the run has been rerouted.
pub fn repeated_failure(
    task: &Task,
    metrics: &RunMetrics,
    config: &TriggerConfig,
) -> Option<ReplanSignal> {
    let (fingerprint, count) = metrics.hottest_fingerprint()?;
    if count < config.repeat_threshold {
        return None;
    }
    Some(ReplanSignal {
        kind: SignalKind::RepeatedFailure,
        task_id: task.id.clone(),
        observed: format!("fingerprint {fingerprint} seen {count} times"),
        threshold: format!(">= {}", config.repeat_threshold),
        suggested: if metrics.reroutes > 0 {
            SuggestedAction::Escalate
        } else {
            SuggestedAction::Reroute
        },
    })
}

/// The agent or the reviewer flagged the task as larger than planned.
pub fn unexpected_complexity(
    task: &Task,
    metrics: &RunMetrics,
    _config: &TriggerConfig,
) -> Option<ReplanSignal> {
    if !metrics.replan_requested && !metrics.review_scope_too_large {
        return None;
    }
    Some(ReplanSignal {
        kind: SignalKind::UnexpectedComplexity,
        task_id: task.id.clone(),
        observed: if metrics.replan_requested {
            "agent requested a replan".to_owned()
        } else {
            "review reported the scope too large".to_owned()
        },
        threshold: "explicit flag".to_owned(),
        suggested: SuggestedAction::Split(SplitStrategy::ByFunctionality),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::stage::{Diagnostic, Fingerprint, Stage};
    use crate::plan::Task;

    fn metrics(task: &Task) -> RunMetrics {
        RunMetrics {
            task_id: task.id.clone(),
            iterations: 1,
            elapsed_minutes: 1.0,
            declared_files: task.files.clone(),
            touched_files: task.files.clone(),
            fingerprint_counts: Default::default(),
            consecutive_same_stage_failures: 0,
            failing_stage: None,
            reroutes: 0,
            replan_requested: false,
            review_scope_too_large: false,
        }
    }

    fn task() -> Task {
        let mut t = Task::new("T1", "t");
        t.estimate_minutes = 10;
        t.files = vec!["a.ts".into()];
        t
    }

    #[test]
    fn time_exceeded_fires_past_the_factor() {
        let task = task();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);

        m.elapsed_minutes = 14.9;
        assert!(time_exceeded(&task, &m, &config).is_none());

        m.elapsed_minutes = 15.1;
        let signal = time_exceeded(&task, &m, &config).expect("should fire");
        assert_eq!(signal.kind, SignalKind::TimeExceeded);
        assert_eq!(
            signal.suggested,
            SuggestedAction::Split(SplitStrategy::ByTime)
        );
    }

    #[test]
    fn iteration_exceeded_escalates_when_stuck_on_one_stage() {
        let task = task();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);

        m.iterations = 10;
        assert!(iteration_exceeded(&task, &m, &config).is_none());

        m.iterations = 11;
        let signal = iteration_exceeded(&task, &m, &config).expect("should fire");
        assert_eq!(signal.suggested, SuggestedAction::ReEstimate);

        m.consecutive_same_stage_failures = 3;
        m.failing_stage = Some(Stage::Test);
        let signal = iteration_exceeded(&task, &m, &config).expect("should fire");
        assert_eq!(signal.suggested, SuggestedAction::Escalate);
    }

    #[test]
    fn scope_creep_fires_on_three_extra_files() {
        let task = task();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);

        m.touched_files = vec!["a.ts".into(), "b.ts".into(), "c.ts".into(), "d.ts".into()];
        let signal = scope_creep(&task, &m, &config).expect("should fire");
        assert_eq!(signal.kind, SignalKind::ScopeCreep);
        assert_eq!(
            signal.suggested,
            SuggestedAction::Split(SplitStrategy::ByFile)
        );
    }

    #[test]
    fn scope_creep_fires_on_ratio() {
        let mut task = task();
        task.files = vec!["a.ts".into(), "b.ts".into()];
        let config = TriggerConfig::default();
        let mut m = metrics(&task);

        // One extra over two declared: 50%, at the ratio threshold.
        m.touched_files = vec!["a.ts".into(), "b.ts".into(), "c.ts".into()];
        assert!(scope_creep(&task, &m, &config).is_some());
    }

    #[test]
    fn scope_creep_ignores_undeclared_tasks() {
        let mut task = task();
        task.files.clear();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);
        m.touched_files = vec!["a.ts".into(), "b.ts".into(), "c.ts".into(), "d.ts".into()];
        assert!(scope_creep(&task, &m, &config).is_none());
    }

    #[test]
    fn repeated_failure_reroutes_then_escalates() {
        let task = task();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);

        let fp = Fingerprint::new("test", &Diagnostic::message("assertion failed"));
        m.fingerprint_counts.insert(fp.clone(), 2);
        assert!(repeated_failure(&task, &m, &config).is_none());

        m.fingerprint_counts.insert(fp.clone(), 3);
        let signal = repeated_failure(&task, &m, &config).expect("should fire");
        assert_eq!(signal.suggested, SuggestedAction::Reroute);

        m.reroutes = 1;
        m.fingerprint_counts.insert(fp, 6);
        let signal = repeated_failure(&task, &m, &config).expect("should fire");
        assert_eq!(signal.suggested, SuggestedAction::Escalate);
    }

    #[test]
    fn unexpected_complexity_fires_on_either_flag() {
        let task = task();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);
        assert!(unexpected_complexity(&task, &m, &config).is_none());

        m.replan_requested = true;
        let signal = unexpected_complexity(&task, &m, &config).expect("should fire");
        assert_eq!(
            signal.suggested,
            SuggestedAction::Split(SplitStrategy::ByFunctionality)
        );

        m.replan_requested = false;
        m.review_scope_too_large = true;
        assert!(unexpected_complexity(&task, &m, &config).is_some());
    }

    #[test]
    fn first_matching_evaluator_wins() {
        let task = task();
        let config = TriggerConfig::default();
        let mut m = metrics(&task);
        // Both TimeExceeded and UnexpectedComplexity would fire; the fixed
        // order picks TimeExceeded.
        m.elapsed_minutes = 60.0;
        m.replan_requested = true;
        let signal = evaluate_all(&task, &m, &config).expect("should fire");
        assert_eq!(signal.kind, SignalKind::TimeExceeded);
    }
}
