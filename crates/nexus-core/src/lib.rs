//! Nexus orchestration core.
//!
//! Drives a pool of LLM-backed coding agents through a disciplined
//! build/lint/test/review/merge cycle until a plan is merged or a human is
//! asked to intervene. Everything external -- agents, toolchain, git,
//! persistence, humans, time -- is injected through the capability traits
//! in [`host`].

pub mod checkpoint;
pub mod coordinator;
pub mod escalate;
pub mod event;
pub mod host;
pub mod iterate;
pub mod plan;
pub mod replan;
pub mod split;

pub use checkpoint::Checkpoint;
pub use coordinator::{
    Capabilities, CascadePolicy, CoordinatorConfig, NexusCoordinator, PlanOutcome,
};
pub use event::{EventBus, NexusEvent};
pub use plan::{Plan, Task, TaskId, TaskStatus};
