//! Plan model: tasks, dependency DAG, validation, waves, `plan.toml`.

pub mod model;
pub mod parser;
pub mod resolver;
pub mod toml_format;
pub mod validate;

pub use model::{MAX_ESTIMATE_MINUTES, Plan, Priority, Task, TaskId, TaskStatus};
pub use parser::{PlanParseError, parse_plan_toml};
pub use resolver::{KahnResolver, Wave, WaveResolver, current_wave, refresh_ready};
pub use toml_format::{PlanMeta, PlanToml, TaskToml};
pub use validate::{PlanError, validate_plan};
