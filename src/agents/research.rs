//! Research agent (spec.md §4.5).
//!
//! Drives `web_search` / `search_wikipedia` through the tool-calling loop,
//! accumulating citations from tool results until the LLM produces a final
//! summary. Breadth is bounded by [`ResearchStrategy`]; depth of further
//! sub-research is bounded by [`crate::agents::MAX_SUB_RESEARCH`].

use crate::agent::{run_tool_calling_loop, AgentHandle, ToolLoopOptions};
use crate::client_wrapper::{Completer, Message};
use crate::classifier::ResearchStrategy;
use crate::errors::OrchestratorError;
use crate::tool_protocol::ToolRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One source surfaced by a tool call during research.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

/// Output of [`run_research`].
#[derive(Debug, Clone)]
pub struct ResearchResult {
    pub citations: Vec<Citation>,
    pub summary: String,
    pub needs_deeper: bool,
    pub tokens_used: u32,
}

/// How many search results a research agent fetches at once, keyed by
/// strategy (spec.md §4.5: quick=3, adaptive=5, deep=8).
pub fn max_results_for_strategy(strategy: ResearchStrategy) -> u32 {
    match strategy {
        ResearchStrategy::Quick => 3,
        ResearchStrategy::Adaptive => 5,
        ResearchStrategy::Deep => 8,
    }
}

const NEEDS_DEEPER_MARKER: &str = "[NEEDS_DEEPER]";

fn extract_citations_from_tool_output(output: &Value, citations: &mut Vec<Citation>) {
    let Some(results) = output.get("results").and_then(|v| v.as_array()) else {
        return;
    };
    for result in results {
        let title = result.get("title").and_then(|v| v.as_str()).unwrap_or("untitled").to_string();
        let url = result.get("url").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let snippet = result.get("snippet").and_then(|v| v.as_str()).map(|s| s.to_string());
        citations.push(Citation { title, url, snippet });
    }
}

/// Runs the research agent's tool-calling loop for `task`, then extracts
/// citations from any `web_search`/`search_wikipedia` tool results produced
/// along the way and a final summary from the LLM's closing reply.
///
/// The LLM signals it wants a deeper follow-up pass by including the literal
/// marker `[NEEDS_DEEPER]` anywhere in its final reply; the marker is
/// stripped from the returned summary.
pub async fn run_research(
    handle: &AgentHandle,
    completer: &dyn Completer,
    registry: &ToolRegistry,
    task: &str,
    strategy: ResearchStrategy,
    model_id: &str,
) -> Result<ResearchResult, OrchestratorError> {
    let max_results = max_results_for_strategy(strategy);
    let system_prompt = handle.definition.render(&[
        ("task".to_string(), task.to_string()),
        ("maxResults".to_string(), max_results.to_string()),
    ].into_iter().collect());

    let messages = vec![Message::system(system_prompt), Message::user(task.to_string())];

    let result = run_tool_calling_loop(
        handle,
        completer,
        registry,
        messages,
        ToolLoopOptions { model_id: model_id.to_string(), max_tool_calls: 5, ..Default::default() },
    )
    .await?;

    let mut citations = Vec::new();
    for (tool, output) in &result.tool_outputs {
        if tool == "web_search" || tool == "search_wikipedia" {
            extract_citations_from_tool_output(output, &mut citations);
        }
    }

    let needs_deeper = result.content.contains(NEEDS_DEEPER_MARKER);
    let summary = result.content.replace(NEEDS_DEEPER_MARKER, "").trim().to_string();

    Ok(ResearchResult { citations, summary, needs_deeper, tokens_used: result.tokens_used })
}
