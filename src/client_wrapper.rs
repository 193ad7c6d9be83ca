//! LLM completion capability.
//!
//! Concrete provider HTTP clients are out of scope for this crate (spec.md
//! §1) — applications plug in their own by implementing [`Completer`]. This
//! module only defines the message/role vocabulary and the two operations
//! (`complete`, `stream`) that the orchestrator and agent runtime depend on.
//!
//! # Example
//!
//! ```rust,no_run
//! use orito_core::client_wrapper::{Completer, CompletionOptions, CompletionResult, Message, Role};
//! use async_trait::async_trait;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Completer for Echo {
//!     async fn complete(
//!         &self,
//!         messages: &[Message],
//!         _opts: &CompletionOptions,
//!     ) -> Result<CompletionResult, Box<dyn std::error::Error + Send + Sync>> {
//!         let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
//!         Ok(CompletionResult { content: last, tool_calls: vec![], model_used: "echo".into(), usage: None })
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Who authored a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn in a conversation, per spec.md §3 `messageHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Token accounting for a single completion call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A tool the LLM is permitted to call natively, provided for providers with
/// function-calling support. Orito's tool-calling loop (spec.md §4.4) uses
/// the `<tool>NAME</tool><params>JSON</params>` sentinel contract by default
/// (see [`crate::agent`]); native tool definitions are forwarded so providers
/// that prefer structured calling can still honor schema constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A natively-returned tool invocation, if the provider used function-calling
/// JSON instead of emitting the sentinel syntax in message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Per-call knobs, matching spec.md §6.1's `complete`/`stream` options bag.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<String>,
    pub skip_cache: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            temperature: 0.7,
            max_tokens: 4096,
            tools: None,
            tool_choice: None,
            skip_cache: false,
        }
    }
}

/// Result of a completion call, whether streamed or not.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub content: String,
    pub tool_calls: Vec<NativeToolCall>,
    pub model_used: String,
    pub usage: Option<TokenUsage>,
}

/// Abstracts a concrete LLM provider behind two operations. Applications
/// supply the HTTP client, retry/backoff, and caching; this crate only
/// calls through the trait.
///
/// Implementors are expected to honor the retry policy from spec.md §6.1
/// (up to 3 attempts, exponential backoff `min(1000*2^(n-1), 30000)` ms plus
/// 0-30% jitter) internally and surface an `LlmError` only after exhausting
/// it; [`retry_with_backoff`] is a ready-made helper for this.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Non-streaming completion.
    async fn complete(
        &self,
        messages: &[Message],
        opts: &CompletionOptions,
    ) -> Result<CompletionResult, Box<dyn Error + Send + Sync>>;

    /// Streaming completion. `on_chunk` is invoked once per partial content
    /// string, in generation order, before the final result is returned.
    /// The default implementation falls back to a single non-streaming call
    /// and delivers it as one chunk — the same fallback the Synthesizer uses
    /// when a provider's stream fails mid-flight (spec.md §4.5).
    async fn stream(
        &self,
        messages: &[Message],
        opts: &CompletionOptions,
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<CompletionResult, Box<dyn Error + Send + Sync>> {
        let result = self.complete(messages, opts).await?;
        on_chunk(result.content.clone());
        Ok(result)
    }
}

/// Exponential backoff with jitter, per spec.md §6.1: `min(1000*2^(n-1),
/// 30000)` ms plus 0-30% jitter, up to `max_attempts`.
///
/// `attempt` is 1-based. Returns the last error once attempts are exhausted,
/// wrapped as [`crate::errors::OrchestratorError::LlmError`].
pub async fn retry_with_backoff<F, Fut, T>(
    max_attempts: u32,
    mut f: F,
) -> Result<T, crate::errors::OrchestratorError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, Box<dyn Error + Send + Sync>>>,
{
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                if attempt < max_attempts {
                    let base_ms = (1000u64 * 2u64.pow(attempt - 1)).min(30_000);
                    let jitter_frac: f64 = rand::random::<f64>() * 0.3;
                    let delay_ms = base_ms + (base_ms as f64 * jitter_frac) as u64;
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
    Err(crate::errors::OrchestratorError::LlmError { attempts: max_attempts, last_error })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl Completer for AlwaysFails {
        async fn complete(
            &self,
            _messages: &[Message],
            _opts: &CompletionOptions,
        ) -> Result<CompletionResult, Box<dyn Error + Send + Sync>> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn stream_falls_back_to_complete_and_emits_one_chunk() {
        struct NonStreaming;

        #[async_trait]
        impl Completer for NonStreaming {
            async fn complete(
                &self,
                _messages: &[Message],
                _opts: &CompletionOptions,
            ) -> Result<CompletionResult, Box<dyn Error + Send + Sync>> {
                Ok(CompletionResult {
                    content: "hello".into(),
                    tool_calls: vec![],
                    model_used: "test-model".into(),
                    usage: None,
                })
            }
        }

        let mut chunks = Vec::new();
        let completer = NonStreaming;
        let result = completer
            .stream(&[], &CompletionOptions::default(), &mut |c| chunks.push(c))
            .await
            .unwrap();

        assert_eq!(chunks, vec!["hello".to_string()]);
        assert_eq!(result.content, "hello");
    }

    #[tokio::test]
    async fn retry_with_backoff_exhausts_and_reports_attempts() {
        let completer = AlwaysFails;
        let result: Result<(), _> = retry_with_backoff(2, |_attempt| async {
            completer.complete(&[], &CompletionOptions::default()).await?;
            Ok(())
        })
        .await;

        match result {
            Err(crate::errors::OrchestratorError::LlmError { attempts, .. }) => {
                assert_eq!(attempts, 2)
            }
            other => panic!("expected LlmError, got {other:?}"),
        }
    }
}
