//! Handlers for `nexus plan` subcommands and checkpoint listing.

use std::path::Path;

use anyhow::{Context, Result};

use nexus_core::host::PersistenceGateway;
use nexus_core::plan::{KahnResolver, Plan, WaveResolver, parse_plan_toml};

use crate::store::JsonFileStore;

/// Read and parse a plan file.
fn load_plan(file_path: &str) -> Result<Plan> {
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read plan file: {file_path}"))?;
    parse_plan_toml(&content).with_context(|| format!("failed to parse plan file: {file_path}"))
}

/// `nexus plan validate <file>`
pub fn cmd_validate(file_path: &str) -> Result<()> {
    let plan = load_plan(file_path)?;
    let edges: usize = plan.tasks.iter().map(|t| t.depends_on.len()).sum();
    let total_minutes: u32 = plan.tasks.iter().map(|t| t.estimate_minutes).sum();

    println!("Plan is valid.");
    println!();
    println!("  Name:             {}", plan.name);
    println!("  Tasks:            {}", plan.tasks.len());
    println!("  Dependency edges: {edges}");
    println!("  Total estimate:   {total_minutes} min");
    Ok(())
}

/// `nexus plan show <file>`
pub fn cmd_show(file_path: &str) -> Result<()> {
    let plan = load_plan(file_path)?;

    println!("{} ({} tasks)", plan.name, plan.tasks.len());
    println!();
    for task in &plan.tasks {
        println!(
            "  {:<14} {:<32} {:>3} min  {}",
            task.id.to_string(),
            truncate(&task.name, 32),
            task.estimate_minutes,
            task.priority,
        );
        if !task.depends_on.is_empty() {
            let deps: Vec<&str> = task.depends_on.iter().map(|d| d.as_str()).collect();
            println!("  {:<14} depends on: {}", "", deps.join(", "));
        }
    }
    Ok(())
}

/// `nexus plan waves <file>`
pub fn cmd_waves(file_path: &str) -> Result<()> {
    let plan = load_plan(file_path)?;
    let waves = KahnResolver.resolve(&plan)?;

    println!("{} waves:", waves.len());
    for (i, wave) in waves.iter().enumerate() {
        let ids: Vec<&str> = wave.tasks.iter().map(|t| t.as_str()).collect();
        println!("  wave {:>2}: {}", i + 1, ids.join(", "));
    }
    Ok(())
}

/// `nexus checkpoints`
pub async fn cmd_checkpoints(state_dir: &Path) -> Result<()> {
    let store = JsonFileStore::open(state_dir)?;
    let ids = store.list_checkpoints().await?;

    if ids.is_empty() {
        println!("No checkpoints in {}.", state_dir.display());
        return Ok(());
    }

    println!("{} checkpoints in {}:", ids.len(), state_dir.display());
    for id in ids {
        if let Some(cp) = store.read_checkpoint(id).await? {
            let done = cp
                .task_statuses
                .values()
                .filter(|s| s.is_terminal())
                .count();
            println!(
                "  {}  {}  plan {:<24} v{}  {}/{} terminal",
                cp.id,
                cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                truncate(&cp.plan.name, 24),
                cp.plan.version,
                done,
                cp.task_statuses.len(),
            );
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
