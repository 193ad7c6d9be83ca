//! Synthesizer agent (spec.md §4.5).
//!
//! Streams the LLM's prose response as `message:chunk` events, falling back
//! to a single non-streaming call if the stream fails mid-flight, then
//! appends a deterministic markdown "Interactive Guide" section built
//! directly from the upstream research/plan/validation data — independent
//! of whatever the LLM produced.

use crate::agent::AgentHandle;
use crate::agents::planner::{PlannedCommand, Risk};
use crate::agents::validator::BlockedCommand;
use crate::client_wrapper::{Completer, CompletionOptions, Message};
use crate::errors::OrchestratorError;
use crate::event::EventKind;
use serde::{Deserialize, Serialize};

/// Inputs the deterministic guide section is built from; independent of
/// pipeline tier (a moderate-tier turn passes empty commands/prerequisites).
#[derive(Debug, Clone, Default)]
pub struct SynthesisInput {
    pub research_summary: String,
    pub steps: Vec<String>,
    pub commands: Vec<PlannedCommand>,
    pub citations: Vec<String>,
    pub warnings: Vec<String>,
    pub blocked: Vec<BlockedCommand>,
    pub suggestions: Vec<String>,
    pub prerequisites: Vec<String>,
    pub troubleshooting: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub response_type: String,
    pub complexity: String,
    pub command_count: usize,
}

pub struct SynthesizerResult {
    pub response: String,
    pub metadata: ResponseMetadata,
    pub tokens_used: u32,
}

fn risk_glyph(risk: Risk) -> &'static str {
    match risk {
        Risk::Low => "🟢",
        Risk::Medium => "🟡",
        Risk::High => "🔴",
    }
}

/// Builds the deterministic "Interactive Guide" markdown section from
/// `input`, independent of LLM output (spec.md §4.5).
pub fn build_interactive_guide(input: &SynthesisInput) -> String {
    let mut out = String::new();
    out.push_str("## Interactive Guide\n\n");

    out.push_str("### Overview\n");
    out.push_str(&input.research_summary);
    out.push_str("\n\n");

    if !input.prerequisites.is_empty() {
        out.push_str("### Prerequisites\n");
        for item in &input.prerequisites {
            out.push_str(&format!("- {item}\n"));
        }
        out.push('\n');
    }

    if !input.steps.is_empty() {
        out.push_str("### Steps\n");
        for (i, step) in input.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out.push('\n');
    }

    if !input.commands.is_empty() {
        out.push_str("### Commands\n");
        for cmd in &input.commands {
            out.push_str(&format!("- {} `{}` — {}\n", risk_glyph(cmd.risk), cmd.command, cmd.risk_explanation));
        }
        out.push('\n');
    }

    if !input.citations.is_empty() {
        out.push_str("### Verification\n");
        for citation in &input.citations {
            out.push_str(&format!("- {citation}\n"));
        }
        out.push('\n');
    }

    if !input.warnings.is_empty() {
        out.push_str("### Warnings\n");
        for warning in &input.warnings {
            out.push_str(&format!("- {warning}\n"));
        }
        out.push('\n');
    }

    if !input.blocked.is_empty() {
        out.push_str("### Blocked Commands\n");
        for blocked in &input.blocked {
            out.push_str(&format!("- `{}` — {}\n", blocked.command, blocked.reason));
        }
        out.push('\n');
    }

    if !input.suggestions.is_empty() {
        out.push_str("### Suggestions\n");
        for suggestion in &input.suggestions {
            out.push_str(&format!("- {suggestion}\n"));
        }
        out.push('\n');
    }

    if !input.troubleshooting.is_empty() {
        out.push_str("### Troubleshooting\n");
        for item in &input.troubleshooting {
            out.push_str(&format!("- {item}\n"));
        }
        out.push('\n');
    }

    out.trim_end().to_string()
}

/// Streams the LLM's prose reply as `message:chunk` events (falling back to
/// one non-streaming call and a single chunk if the stream fails), then
/// appends the deterministic guide section.
pub async fn run_synthesizer(
    handle: &AgentHandle,
    completer: &dyn Completer,
    messages: Vec<Message>,
    opts: &CompletionOptions,
    input: &SynthesisInput,
    complexity: &str,
) -> Result<SynthesizerResult, OrchestratorError> {
    let mut streamed_content = String::new();
    let mut stream_usage = None;
    let mut stream_failed = false;

    {
        let mut on_chunk = |chunk: String| {
            streamed_content.push_str(&chunk);
        };
        match completer.stream(&messages, opts, &mut on_chunk).await {
            Ok(result) => stream_usage = result.usage,
            Err(_) => stream_failed = true,
        }
    }

    let (prose, tokens_used) = if stream_failed || streamed_content.is_empty() {
        match completer.complete(&messages, opts).await {
            Ok(result) => (result.content, result.usage.map(|u| u.total_tokens).unwrap_or(0)),
            Err(e) => {
                return Err(OrchestratorError::LlmError { attempts: 1, last_error: e.to_string() });
            }
        }
    } else {
        (streamed_content, stream_usage.map(|u| u.total_tokens).unwrap_or(0))
    };

    handle.emit(EventKind::MessageChunk { content: prose.clone() }).await;

    let guide = build_interactive_guide(input);
    let response = format!("{prose}\n\n{guide}");
    handle.emit(EventKind::MessageChunk { content: format!("\n\n{guide}") }).await;

    let metadata = ResponseMetadata {
        response_type: if input.commands.is_empty() { "informational".to_string() } else { "actionable".to_string() },
        complexity: complexity.to_string(),
        command_count: input.commands.len(),
    };

    Ok(SynthesizerResult { response, metadata, tokens_used })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentDefaults, AgentDefinition, AgentHandle};
    use crate::agents::planner::PrivilegeLevel;
    use crate::client_wrapper::{CompletionResult, TokenUsage};
    use crate::event::EventBus;
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::Arc;

    struct StubCompleter {
        usage: TokenUsage,
    }

    #[async_trait]
    impl Completer for StubCompleter {
        async fn complete(
            &self,
            _messages: &[Message],
            _opts: &CompletionOptions,
        ) -> Result<CompletionResult, Box<dyn Error + Send + Sync>> {
            Ok(CompletionResult {
                content: "here is how to do it.".to_string(),
                tool_calls: vec![],
                model_used: "stub".to_string(),
                usage: Some(self.usage),
            })
        }

        async fn stream(
            &self,
            _messages: &[Message],
            _opts: &CompletionOptions,
            on_chunk: &mut (dyn FnMut(String) + Send),
        ) -> Result<CompletionResult, Box<dyn Error + Send + Sync>> {
            on_chunk("here is how to do it.".to_string());
            Ok(CompletionResult {
                content: "here is how to do it.".to_string(),
                tool_calls: vec![],
                model_used: "stub".to_string(),
                usage: Some(self.usage),
            })
        }
    }

    fn handle() -> AgentHandle {
        let definition = AgentDefinition::parse(
            "synthesizer",
            "---\nname: Synthesizer\ndescription: d\nmode: m\ncolor: blue\ntools: \n---\nbody",
        )
        .unwrap();
        AgentHandle::new("agent-1", "synthesizer", definition, 0, Arc::new(EventBus::new()), AgentDefaults::default())
    }

    #[tokio::test]
    async fn tokens_used_is_summed_from_stream_usage() {
        let completer = StubCompleter { usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 } };
        let handle = handle();
        let messages = vec![Message::user("how do I install nginx?".to_string())];
        let opts = CompletionOptions::default();
        let input = SynthesisInput::default();

        let result = run_synthesizer(&handle, &completer, messages, &opts, &input, "moderate").await.unwrap();

        assert_eq!(result.tokens_used, 15);
    }

    #[test]
    fn guide_includes_only_nonempty_sections() {
        let input = SynthesisInput {
            research_summary: "systemd is the init system.".to_string(),
            ..Default::default()
        };
        let guide = build_interactive_guide(&input);
        assert!(guide.contains("Overview"));
        assert!(!guide.contains("Commands"));
        assert!(!guide.contains("Blocked Commands"));
    }

    #[test]
    fn guide_renders_risk_glyphs_for_commands() {
        let input = SynthesisInput {
            commands: vec![PlannedCommand {
                command: "apt install nginx".to_string(),
                privilege_level: PrivilegeLevel::Root,
                risk: Risk::Low,
                risk_explanation: "standard install".to_string(),
                dry_run_hint: None,
                expected_output: None,
                citations: vec![],
            }],
            ..Default::default()
        };
        let guide = build_interactive_guide(&input);
        assert!(guide.contains("🟢"));
        assert!(guide.contains("apt install nginx"));
    }

    #[test]
    fn guide_lists_blocked_commands_with_reason() {
        let input = SynthesisInput {
            blocked: vec![BlockedCommand {
                command: "rm -rf /".to_string(),
                reason: "destructive".to_string(),
            }],
            ..Default::default()
        };
        let guide = build_interactive_guide(&input);
        assert!(guide.contains("Blocked Commands"));
        assert!(guide.contains("destructive"));
    }
}
