pub mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::CommandResult;

#[derive(Debug, Parser)]
#[command(
    name = "signoff",
    version,
    about = "Operator CLI for the signoff approval engine",
    after_help = "Examples:\n  signoff migrate\n  signoff seed\n  signoff doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending database migrations and verify the schema afterwards.
    Migrate,
    /// Load and verify the deterministic demo flows, delegation and history.
    Seed,
    /// Run end-to-end readiness checks with per-check timing details.
    Smoke,
    /// Print the effective configuration with source attribution; secrets stay redacted.
    Config,
    /// Validate configuration, database connectivity and schema presence.
    Doctor {
        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn execute(self) -> CommandResult {
        match self {
            Self::Migrate => commands::migrate::run(),
            Self::Seed => commands::seed::run(),
            Self::Smoke => commands::smoke::run(),
            Self::Config => CommandResult { exit_code: 0, output: commands::config::run() },
            Self::Doctor { json } => {
                CommandResult { exit_code: 0, output: commands::doctor::run(json) }
            }
        }
    }
}

pub fn run() -> ExitCode {
    init_tracing();
    let result = Cli::parse().command.execute();
    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
