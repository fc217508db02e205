mod plan_cmds;
mod simulate_cmd;
mod store;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nexus", about = "Autonomous software-development orchestrator")]
struct Cli {
    /// State directory for checkpoints (defaults to the platform data dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan inspection
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Run a plan through the coordinator with simulated capabilities
    Simulate {
        /// Path to the plan TOML file
        file: String,
        /// Maximum number of concurrent task slots
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
    },
    /// List stored checkpoints
    Checkpoints,
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Parse and validate a plan file
    Validate {
        /// Path to the plan TOML file
        file: String,
    },
    /// Show plan details
    Show {
        /// Path to the plan TOML file
        file: String,
    },
    /// Print the wave schedule for a plan
    Waves {
        /// Path to the plan TOML file
        file: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(store::default_state_dir);

    match cli.command {
        Commands::Plan { command } => match command {
            PlanCommands::Validate { file } => plan_cmds::cmd_validate(&file),
            PlanCommands::Show { file } => plan_cmds::cmd_show(&file),
            PlanCommands::Waves { file } => plan_cmds::cmd_waves(&file),
        },
        Commands::Simulate {
            file,
            max_concurrent,
        } => simulate_cmd::run_simulation(&file, max_concurrent, &state_dir).await,
        Commands::Checkpoints => plan_cmds::cmd_checkpoints(&state_dir).await,
    }
}
