//! Curious agent: the system-profile elicitor (spec.md §4.5).
//!
//! Two modes: *command mode* returns shell discovery commands the client
//! should run and report back; *question mode* drives the interactive
//! profile collector (spec.md §4.7). A task that mentions an error or
//! problem may additionally request a research sub-agent for background
//! reading while the user answers.

use crate::profile::question_set;
use serde::{Deserialize, Serialize};

/// One discovery command mapped to the profile field it fills in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryCommand {
    pub field: String,
    pub command: String,
}

/// Output of the curious agent, regardless of mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuriousOutput {
    pub commands: Vec<String>,
    pub prompt: String,
    pub fields: Vec<String>,
}

/// Fixed table mapping a missing profile field to the shell command that
/// discovers it (spec.md §4.5 command mode).
fn discovery_command_for_field(field: &str) -> DiscoveryCommand {
    let command = match field {
        "distro" | "version" => "cat /etc/os-release",
        "packageManager" => "which apt dnf pacman zypper 2>/dev/null",
        "shell" => "echo $SHELL",
        "desktopEnvironment" => "echo $XDG_CURRENT_DESKTOP",
        _ => "uname -a",
    };
    DiscoveryCommand { field: field.to_string(), command: command.to_string() }
}

/// Command mode: given the profile fields still missing, returns the
/// discovery commands to run and a friendly prompt asking the user to paste
/// the output back.
pub fn run_command_mode(missing_fields: &[&str]) -> CuriousOutput {
    let mapped: Vec<DiscoveryCommand> =
        missing_fields.iter().map(|f| discovery_command_for_field(f)).collect();

    let commands: Vec<String> = mapped
        .iter()
        .map(|m| m.command.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    CuriousOutput {
        commands,
        prompt: "I need a bit more information about your system. Could you run the commands \
                 above and paste the output back?"
            .to_string(),
        fields: missing_fields.iter().map(|f| f.to_string()).collect(),
    }
}

/// Question mode: returns the fixed question set, mirroring the Profile
/// Collector, with an acknowledgment prompt for once all are answered.
pub fn run_question_mode() -> CuriousOutput {
    let fields: Vec<String> = question_set().into_iter().map(|q| q.field.to_string()).collect();
    CuriousOutput {
        commands: vec![],
        prompt: "Thanks, I've got everything I need to help with your system.".to_string(),
        fields,
    }
}

const PROBLEM_KEYWORDS: &[&str] = &["error", "problem", "issue", "broken", "fail", "crash"];

/// Whether `task` suggests the curious agent should additionally spawn a
/// research sub-agent for background reading (spec.md §4.5).
pub fn should_spawn_research(task: &str) -> bool {
    let lower = task.to_lowercase();
    PROBLEM_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_mode_maps_missing_fields_to_discovery_commands() {
        let output = run_command_mode(&["distro", "shell"]);
        assert_eq!(output.fields, vec!["distro", "shell"]);
        assert!(output.commands.iter().any(|c| c.contains("os-release")));
        assert!(output.commands.iter().any(|c| c.contains("SHELL")));
    }

    #[test]
    fn question_mode_returns_all_five_fields() {
        let output = run_question_mode();
        assert_eq!(output.fields.len(), 5);
    }

    #[test]
    fn error_mentioning_task_spawns_research() {
        assert!(should_spawn_research("my wifi driver is broken after the update"));
        assert!(!should_spawn_research("what distro am I running"));
    }
}
