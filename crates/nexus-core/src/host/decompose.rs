//! Plan sources and decomposition.
//!
//! Genesis mode decomposes a requirements artifact; Evolution mode
//! decomposes a single Kanban card into a mini-plan. The orchestration
//! loop is identical either way.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plan::{Plan, Task};

/// A requirements document driving Genesis mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementsArtifact {
    pub title: String,
    pub body: String,
}

/// A Kanban card driving Evolution mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanCard {
    pub id: String,
    pub title: String,
    pub body: String,
    /// Area of the codebase the card touches; scopes the context provider.
    pub area: Option<String>,
}

/// What a plan is decomposed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanSource {
    Requirements(RequirementsArtifact),
    Kanban(KanbanCard),
}

/// Turns a plan source into an initial plan. LLM-backed in production,
/// scripted in tests.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, source: &PlanSource) -> Result<Plan>;
}

/// Produces a fresh time estimate for a task, used after a ReEstimate
/// decision.
#[async_trait]
pub trait TimeEstimator: Send + Sync {
    async fn estimate(&self, task: &Task) -> Result<u32>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Decomposer, _: &dyn TimeEstimator) {}
};
