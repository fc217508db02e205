//! Typed events the core emits toward UIs and log sinks.
//!
//! Per-task event order is preserved; cross-task order is meaningful only
//! where causally related. The coordinator owns the sender; anyone may
//! subscribe.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::iterate::stage::Stage;
use crate::plan::TaskId;

/// Everything observable about a running plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NexusEvent {
    TaskStarted { task_id: TaskId },
    StageEntered { task_id: TaskId, stage: Stage, iteration: u32 },
    StageCompleted { task_id: TaskId, stage: Stage, iteration: u32, passed: bool },
    IterationAdvanced { task_id: TaskId, iteration: u32 },
    ReplanApplied { plan_version: u64, task_id: TaskId, action: String },
    Escalated { task_id: TaskId, package_id: Uuid },
    Resumed { task_id: TaskId },
    TaskCompleted { task_id: TaskId },
    TaskAbandoned { task_id: TaskId, reason: String },
    WaveCheckpointed { checkpoint_id: Uuid, wave_size: usize },
    PlanCompleted { plan_id: Uuid, success: bool },
}

/// Broadcast fan-out for [`NexusEvent`]s. Slow subscribers drop oldest
/// events rather than backpressure the scheduler.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NexusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NexusEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; silently a no-op when nobody listens.
    pub fn emit(&self, event: NexusEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
