pub mod config;
pub mod doctor;
pub mod migrate;
pub mod seed;
pub mod smoke;

use serde::Serialize;
use signoff_core::config::{AppConfig, LoadOptions};

/// What a subcommand hands back to the shell: one line of JSON on stdout and
/// the process exit code.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum OutcomeStatus {
    Ok,
    Error,
}

#[derive(Debug, Serialize)]
struct CommandOutcome<'a> {
    command: &'a str,
    status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_class: Option<&'a str>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::render(command, OutcomeStatus::Ok, None, message.into(), 0)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::render(command, OutcomeStatus::Error, Some(error_class), message.into(), exit_code)
    }

    fn render(
        command: &str,
        status: OutcomeStatus,
        error_class: Option<&str>,
        message: String,
        exit_code: u8,
    ) -> Self {
        let outcome = CommandOutcome { command, status, error_class, message };
        let output = serde_json::to_string(&outcome).unwrap_or_else(|error| {
            format!(
                "{{\"command\":\"{command}\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        Self { exit_code, output }
    }
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Load and validate configuration, mapping failure into the command's error
/// envelope (exit code 2).
pub(crate) fn load_config(command: &'static str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

/// Single-threaded runtime for commands that need the async database layer
/// (exit code 3 on failure).
pub(crate) fn current_thread_runtime(
    command: &'static str,
) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}
