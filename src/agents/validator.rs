//! Validator agent (spec.md §4.5).
//!
//! Runs each planner-proposed command through the `validate_command` tool,
//! then applies deterministic rules: blocked commands never reach
//! `validated_commands`, package-manager mismatches produce a warning and a
//! suggestion, and risky commands with a dry-run form get a suggestion to
//! try that first.

use crate::agents::planner::{PlannedCommand, Risk};
use crate::tool_protocol::ToolRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A command rejected by `validate_command`, with the reason attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedCommand {
    pub command: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorResult {
    pub validated_commands: Vec<PlannedCommand>,
    pub blocked: Vec<BlockedCommand>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub tokens_used: u32,
}

/// Package managers recognized when checking for a command/detected-PM
/// mismatch (spec.md §4.5).
const KNOWN_PACKAGE_MANAGERS: &[&str] = &["apt", "dnf", "pacman", "zypper"];

fn command_package_manager(command: &str) -> Option<&'static str> {
    let first_word = command.split_whitespace().find(|w| *w != "sudo")?;
    KNOWN_PACKAGE_MANAGERS.iter().find(|pm| first_word == **pm).copied()
}

fn dry_run_suggestion(command: &PlannedCommand) -> Option<String> {
    command
        .dry_run_hint
        .as_ref()
        .filter(|_| command.risk != Risk::Low)
        .map(|hint| format!("Consider a dry run first: `{hint}`"))
}

/// Validates each command via the `validate_command` tool, then applies the
/// package-manager-mismatch and dry-run-suggestion rules. `blocked` and
/// `validated_commands` are disjoint by command string, per spec.md
/// testable property 6.
pub async fn run_validator(
    registry: &ToolRegistry,
    commands: Vec<PlannedCommand>,
    detected_package_manager: &str,
) -> ValidatorResult {
    let mut result = ValidatorResult::default();

    for command in commands {
        let mut args = HashMap::new();
        args.insert("command".to_string(), serde_json::json!(command.command));

        let execution = registry.execute("validate_command", args, &["validate_command".to_string()], &[]).await;

        let blocked_reason = match execution {
            Ok(exec) => exec
                .data
                .as_ref()
                .and_then(|d| d.get("blocked").and_then(|b| b.as_bool()))
                .filter(|blocked| *blocked)
                .and_then(|_| exec.data.as_ref())
                .and_then(|d| d.get("reason").and_then(|r| r.as_str()))
                .map(|r| r.to_string()),
            Err(_) => None,
        };

        if let Some(reason) = blocked_reason {
            result.blocked.push(BlockedCommand { command: command.command.clone(), reason });
            continue;
        }

        if let Some(command_pm) = command_package_manager(&command.command) {
            if command_pm != detected_package_manager {
                result.warnings.push(format!(
                    "Command uses {command_pm}, but the detected package manager is {detected_package_manager}"
                ));
                result.suggestions.push(format!(
                    "Consider rewriting this command using {detected_package_manager} instead of {command_pm}"
                ));
            }
        }

        if let Some(suggestion) = dry_run_suggestion(&command) {
            result.suggestions.push(suggestion);
        }

        result.validated_commands.push(command);
    }

    result
}
