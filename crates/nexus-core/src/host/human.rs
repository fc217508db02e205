//! Human-in-the-loop seam: notifications and escalation decisions.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::escalate::EscalationPackage;
use crate::split::SplitStrategy;

/// What a human decided about an escalated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecision {
    /// Put the task back in the queue unchanged.
    Resume,
    /// Give up on the task; dependents cascade per policy.
    Abandon,
    /// Split the task with the given strategy and queue the children.
    Reassign(SplitStrategy),
}

/// Delivers escalation packages to humans and collects their decisions.
///
/// `await_decision` blocks as long as the human takes -- there is no
/// timeout unless the host configures an escalation budget on its side.
#[async_trait]
pub trait HumanChannel: Send + Sync {
    async fn notify(&self, package: &EscalationPackage) -> Result<()>;

    async fn await_decision(&self, package_id: Uuid) -> Result<HumanDecision>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn HumanChannel) {}
};
