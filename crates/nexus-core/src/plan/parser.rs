//! `plan.toml` parser with validation.
//!
//! Parses a plan document into a [`Plan`] and validates:
//! - Task ids are unique and non-empty.
//! - `depends_on` references point to existing task ids.
//! - Priority values are valid enum variants.
//! - Estimates fall within the 30-minute cap.
//! - The dependency graph is acyclic.

use thiserror::Error;

use super::model::{Plan, Priority, Task, TaskId, TaskStatus};
use super::toml_format::PlanToml;
use super::validate::{PlanError, validate_plan};

/// Errors that can occur during plan parsing and validation.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("plan must contain at least one task")]
    NoTasks,

    #[error("task {task:?} has an empty id")]
    EmptyTaskId { task: String },

    #[error("invalid priority {value:?} on task {task:?} (expected low, normal, or high)")]
    InvalidPriority { task: String, value: String },

    #[error(transparent)]
    Invalid(#[from] PlanError),
}

/// Parse and validate a `plan.toml` string.
pub fn parse_plan_toml(content: &str) -> Result<Plan, PlanParseError> {
    let doc: PlanToml = toml::from_str(content)?;

    if doc.tasks.is_empty() {
        return Err(PlanParseError::NoTasks);
    }

    let mut tasks = Vec::with_capacity(doc.tasks.len());
    for entry in &doc.tasks {
        if entry.id.trim().is_empty() {
            return Err(PlanParseError::EmptyTaskId {
                task: entry.name.clone(),
            });
        }

        let priority: Priority =
            entry
                .priority
                .parse()
                .map_err(|_| PlanParseError::InvalidPriority {
                    task: entry.id.clone(),
                    value: entry.priority.clone(),
                })?;

        let metadata = entry
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), toml_to_json(v)))
            .collect();

        tasks.push(Task {
            id: TaskId::new(entry.id.clone()),
            name: entry.name.clone(),
            description: entry.description.clone(),
            files: entry.files.clone(),
            acceptance: entry.acceptance.clone(),
            depends_on: entry.depends_on.iter().map(TaskId::from).collect(),
            estimate_minutes: entry.estimate_minutes,
            priority,
            status: TaskStatus::Pending,
            metadata,
        });
    }

    let plan = Plan::new(doc.plan.name, tasks);
    validate_plan(&plan)?;
    Ok(plan)
}

fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => serde_json::Value::from(*f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

impl From<&String> for TaskId {
    fn from(s: &String) -> Self {
        TaskId::new(s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_plan() {
        let toml_str = r#"
[plan]
name = "Test"

[[tasks]]
id = "T1"
name = "first"
description = "Task one"
files = ["src/a.rs"]
acceptance = "a() returns 1"
estimate_minutes = 10

[[tasks]]
id = "T2"
name = "second"
description = "Task two"
estimate_minutes = 5
priority = "high"
depends_on = ["T1"]

[tasks.metadata]
tdd = true
"#;
        let plan = parse_plan_toml(toml_str).expect("should parse");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.version, 1);

        let t2 = plan.task(&TaskId::new("T2")).unwrap();
        assert_eq!(t2.priority, Priority::High);
        assert_eq!(t2.depends_on, vec![TaskId::new("T1")]);
        assert_eq!(t2.metadata.get("tdd"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(t2.status, TaskStatus::Pending);
    }

    #[test]
    fn rejects_missing_tasks() {
        let toml_str = r#"
[plan]
name = "No tasks"
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::NoTasks), "got: {err}");
    }

    #[test]
    fn rejects_empty_id() {
        let toml_str = r#"
[plan]
name = "Empty id"

[[tasks]]
id = "  "
name = "bad"
description = "no id"
estimate_minutes = 5
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::EmptyTaskId { .. }), "got: {err}");
    }

    #[test]
    fn rejects_invalid_priority() {
        let toml_str = r#"
[plan]
name = "Bad priority"

[[tasks]]
id = "T1"
name = "t"
description = "t"
estimate_minutes = 5
priority = "urgent"
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(
            matches!(err, PlanParseError::InvalidPriority { .. }),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_oversized_estimate() {
        let toml_str = r#"
[plan]
name = "Too big"

[[tasks]]
id = "T1"
name = "t"
description = "t"
estimate_minutes = 45
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(
            matches!(err, PlanParseError::Invalid(PlanError::EstimateOutOfRange { .. })),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_cycle() {
        let toml_str = r#"
[plan]
name = "Cycle"

[[tasks]]
id = "a"
name = "a"
description = "a"
estimate_minutes = 5
depends_on = ["b"]

[[tasks]]
id = "b"
name = "b"
description = "b"
estimate_minutes = 5
depends_on = ["a"]
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(
            matches!(err, PlanParseError::Invalid(PlanError::CycleDetected(_))),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = parse_plan_toml("this is not valid toml {{{").unwrap_err();
        assert!(matches!(err, PlanParseError::TomlError(_)), "got: {err}");
    }
}
