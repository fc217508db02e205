//! Serde structs for the `plan.toml` authoring format.
//!
//! ```toml
//! [plan]
//! name = "Checkout revamp"
//!
//! [[tasks]]
//! id = "F001-A-01"
//! name = "Extract price formatter"
//! description = "Move price formatting into its own module."
//! files = ["src/price.ts"]
//! acceptance = "formatPrice(1999) renders $19.99"
//! estimate_minutes = 10
//! priority = "normal"
//! depends_on = []
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level structure of a `plan.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanToml {
    pub plan: PlanMeta,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// The `[plan]` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMeta {
    pub name: String,
}

/// One `[[tasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskToml {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub acceptance: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub estimate_minutes: u32,
    /// Priority string; defaults to "normal".
    #[serde(default = "default_priority")]
    pub priority: String,
    /// Open-ended metadata, e.g. `tdd = true`.
    #[serde(default)]
    pub metadata: BTreeMap<String, toml::Value>,
}

fn default_priority() -> String {
    "normal".to_string()
}
