//! Planner agent (spec.md §4.5).
//!
//! Produces an ordered action plan: steps, risk-annotated commands,
//! prerequisites, and troubleshooting notes. Drives `calculate` and
//! `search_packages` through the tool-calling loop, then expects the
//! closing LLM reply to be a JSON object matching [`PlannerOutput`].

use crate::agent::{run_tool_calling_loop, AgentHandle, ToolLoopOptions};
use crate::client_wrapper::{Completer, Message};
use crate::errors::OrchestratorError;
use crate::tool_protocol::ToolRegistry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivilegeLevel {
    ReadOnly,
    User,
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// A single shell command the plan recommends running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCommand {
    pub command: String,
    pub privilege_level: PrivilegeLevel,
    pub risk: Risk,
    pub risk_explanation: String,
    pub dry_run_hint: Option<String>,
    pub expected_output: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

/// Parsed output of the planner's closing reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerOutput {
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<PlannedCommand>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub troubleshooting: Vec<String>,
}

pub struct PlannerResult {
    pub output: PlannerOutput,
    pub tokens_used: u32,
}

impl PlannerOutput {
    /// Whether any planned command carries `risk = high` (spec.md §4.5).
    pub fn has_high_risk_command(&self) -> bool {
        self.commands.iter().any(|c| c.risk == Risk::High)
    }
}

/// Runs the planner's tool-calling loop for `task`, then parses the
/// closing reply as a [`PlannerOutput`]. A reply that isn't valid JSON
/// yields an empty plan with the raw text folded into a single step, so a
/// malformed LLM response degrades gracefully instead of failing the turn.
pub async fn run_planner(
    handle: &AgentHandle,
    completer: &dyn Completer,
    registry: &ToolRegistry,
    task: &str,
    research_summary: &str,
    model_id: &str,
) -> Result<PlannerResult, OrchestratorError> {
    let system_prompt = handle.definition.render(
        &[
            ("task".to_string(), task.to_string()),
            ("researchSummary".to_string(), research_summary.to_string()),
        ]
        .into_iter()
        .collect(),
    );

    let messages = vec![Message::system(system_prompt), Message::user(task.to_string())];

    let result = run_tool_calling_loop(
        handle,
        completer,
        registry,
        messages,
        ToolLoopOptions { model_id: model_id.to_string(), max_tool_calls: 5, ..Default::default() },
    )
    .await?;

    let output = serde_json::from_str(&result.content).unwrap_or_else(|_| PlannerOutput {
        steps: vec![result.content.clone()],
        commands: vec![],
        prerequisites: vec![],
        troubleshooting: vec![],
    });

    Ok(PlannerResult { output, tokens_used: result.tokens_used })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_high_risk_commands() {
        let output = PlannerOutput {
            steps: vec![],
            commands: vec![PlannedCommand {
                command: "rm -rf /var/cache/*".to_string(),
                privilege_level: PrivilegeLevel::Root,
                risk: Risk::High,
                risk_explanation: "deletes cache contents".to_string(),
                dry_run_hint: None,
                expected_output: None,
                citations: vec![],
            }],
            prerequisites: vec![],
            troubleshooting: vec![],
        };
        assert!(output.has_high_risk_command());
    }

    #[test]
    fn low_risk_only_plan_does_not_trigger_validator() {
        let output = PlannerOutput {
            steps: vec![],
            commands: vec![PlannedCommand {
                command: "apt list --installed".to_string(),
                privilege_level: PrivilegeLevel::ReadOnly,
                risk: Risk::Low,
                risk_explanation: "read-only query".to_string(),
                dry_run_hint: None,
                expected_output: None,
                citations: vec![],
            }],
            prerequisites: vec![],
            troubleshooting: vec![],
        };
        assert!(!output.has_high_risk_command());
    }

    #[test]
    fn malformed_json_degrades_to_single_step_plan() {
        let parsed: Result<PlannerOutput, _> = serde_json::from_str("not json");
        assert!(parsed.is_err());
    }
}
