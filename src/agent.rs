//! Base Agent Runtime (spec.md §4.4).
//!
//! Provides the shared machinery every specialized agent (curious, research,
//! planner, validator, synthesizer — see [`crate::agents`]) is built on:
//! definition-driven initialization, metrics, a per-instance circuit
//! breaker, timeout/retry helpers, tool-call validation, the question and
//! sub-agent request protocols, and the `callWithTools` tool-calling loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use orito_core::agent::{AgentHandle, AgentState};
//! use orito_core::agent_definition::AgentDefinition;
//! use orito_core::config::AgentDefaults;
//! use orito_core::event::EventBus;
//! use std::sync::Arc;
//!
//! # fn make_definition() -> AgentDefinition {
//! #     AgentDefinition::parse("demo", "---\nname: Demo\ndescription: d\nmode: m\ncolor: c\ntools: \n---\nbody").unwrap()
//! # }
//! let definition = make_definition();
//! let handle = AgentHandle::new("agent-1", "demo", definition, 0, Arc::new(EventBus::new()), AgentDefaults::default());
//! assert_eq!(handle.state(), AgentState::Spawning);
//! ```

pub use crate::agent_definition::AgentDefinition;
use crate::client_wrapper::{Completer, CompletionOptions, Message};
pub use crate::config::AgentDefaults;
use crate::errors::OrchestratorError;
use crate::event::{Event, EventBus, EventKind, QuestionOption};
use crate::tool_protocol::ToolRegistry;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle states from the spec.md §4.4 state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Spawning,
    Thinking,
    Validating,
    Done,
    Error,
}

/// Timing and token accounting for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tokens_used: u32,
}

impl AgentMetrics {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Per-agent-instance failure counter that opens after `failure_threshold`
/// consecutive failures and closes after `reset_timeout_ms` of wall clock
/// with no new failure (spec.md testable property 12).
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout_ms: u64,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicU64,
}

const NOT_OPEN: u64 = 0;

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms,
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(NOT_OPEN),
        }
    }

    /// Whether the breaker currently permits execution. Resets to closed if
    /// `reset_timeout_ms` has elapsed since it opened.
    pub fn can_execute(&self, now_ms: u64) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
        if opened_at == NOT_OPEN {
            return true;
        }
        if now_ms.saturating_sub(opened_at) >= self.reset_timeout_ms {
            self.opened_at_ms.store(NOT_OPEN, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.opened_at_ms.store(NOT_OPEN, Ordering::SeqCst);
    }

    pub fn record_failure(&self, now_ms: u64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold {
            self.opened_at_ms.store(now_ms.max(1), Ordering::SeqCst);
        }
    }
}

/// A question dispatched via `askUserQuestions`.
#[derive(Debug, Clone)]
pub struct PendingQuestion {
    pub question: String,
    pub header: Option<String>,
    pub purpose: Option<String>,
    pub options: Vec<QuestionOption>,
    pub multiple: bool,
    pub allow_custom: bool,
}

/// A sub-agent spawn request dispatched via `spawnSubAgent`.
#[derive(Debug, Clone)]
pub struct SubAgentRequest {
    pub agent_type: String,
    pub task: String,
    pub input: Value,
    pub extra: Option<Value>,
}

/// Shared runtime state for one agent instance. Specializations embed this
/// and implement only `run` (spec.md §9 re-architecture guidance: inheritance
/// becomes a shared-state struct plus a tagged variant).
pub struct AgentHandle {
    pub id: String,
    pub agent_type: String,
    pub depth: u8,
    pub definition: AgentDefinition,
    state: RwLock<AgentState>,
    metrics: RwLock<AgentMetrics>,
    circuit_breaker: CircuitBreaker,
    event_bus: Arc<EventBus>,
    defaults: AgentDefaults,
    spawned_sub_agents: RwLock<u32>,
}

impl AgentHandle {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        definition: AgentDefinition,
        depth: u8,
        event_bus: Arc<EventBus>,
        defaults: AgentDefaults,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            depth,
            definition,
            state: RwLock::new(AgentState::Spawning),
            metrics: RwLock::new(AgentMetrics::default()),
            circuit_breaker: CircuitBreaker::new(
                defaults.circuit_breaker.failure_threshold,
                defaults.circuit_breaker.reset_timeout_ms,
            ),
            event_bus,
            defaults,
            spawned_sub_agents: RwLock::new(0),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.try_read().expect("state lock is never held across await points")
    }

    pub async fn set_state(&self, state: AgentState) {
        *self.state.write().await = state;
        log::debug!("agent {} ({}) state -> {state:?}", self.id, self.agent_type);
    }

    pub async fn start_metrics(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.started_at = Some(Utc::now());
    }

    pub async fn end_metrics(&self, tokens_used: Option<u32>) {
        let mut metrics = self.metrics.write().await;
        metrics.ended_at = Some(Utc::now());
        if let Some(tokens) = tokens_used {
            metrics.tokens_used += tokens;
        }
    }

    pub async fn metrics_snapshot(&self) -> AgentMetrics {
        self.metrics.read().await.clone()
    }

    /// Whether the breaker currently permits a `run` call.
    pub fn can_execute(&self) -> bool {
        self.circuit_breaker.can_execute(now_ms())
    }

    pub fn record_failure(&self) {
        self.circuit_breaker.record_failure(now_ms());
        log::debug!("agent {} circuit breaker recorded failure", self.id);
    }

    pub fn record_success(&self) {
        self.circuit_breaker.record_success();
    }

    /// `canUseTool(name)`: wildcard-aware check against this agent's
    /// definition tool lists.
    pub fn can_use_tool(&self, name: &str) -> bool {
        ToolRegistry::is_allowed(name, &self.definition.tools, &self.definition.restricted_tools)
    }

    /// `validateToolUse`: emits an `error` event and returns
    /// `ToolNotAllowed` if the tool is denied.
    pub async fn validate_tool_use(&self, name: &str) -> Result<(), OrchestratorError> {
        if self.can_use_tool(name) {
            Ok(())
        } else {
            self.event_bus.emit(Event::error(format!("tool not allowed: {name}"))).await;
            Err(OrchestratorError::ToolNotAllowed(name.to_string()))
        }
    }

    pub async fn emit(&self, kind: EventKind) {
        self.event_bus.emit(Event::new(kind)).await;
    }

    /// `executeWithTimeout(fn, t)`.
    pub async fn execute_with_timeout<F, T>(
        &self,
        fut: F,
        timeout_ms: u64,
        label: &str,
    ) -> Result<T, OrchestratorError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout_ms, label.to_string()))
    }

    /// `executeWithRetry(fn, label)`: retries up to `maxRetries` with linear
    /// backoff `retryDelayMs * (attempt + 1)`; records a circuit-breaker
    /// failure and rethrows once retries are exhausted.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut f: F,
        label: &str,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
    {
        let max_retries = self.defaults.max_retries;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            match f().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries {
                        let delay = self.defaults.retry_delay_ms * (attempt as u64 + 1);
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        self.record_failure();
        Err(last_error.unwrap_or_else(|| OrchestratorError::Other(format!("{label} exhausted retries"))))
    }

    /// `askUserQuestions`: emits one `agent:question` event per question
    /// with a fresh id, then waits for the orchestrator to resolve it
    /// (default 120s timeout).
    ///
    /// `register` is called with `(question_id, sender)` for each question;
    /// the caller (orchestrator) is expected to store `sender` in its
    /// pending-question map, keyed by `question_id`, and complete it from
    /// `resolve_user_answer` (spec.md §4.8). This keeps the pending map
    /// itself orchestrator-owned, per spec.md §5's shared-resource policy.
    pub async fn ask_user_questions(
        &self,
        questions: Vec<PendingQuestion>,
        mut register: impl FnMut(String, oneshot::Sender<String>),
    ) -> Result<Vec<String>, OrchestratorError> {
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            let question_id = Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            register(question_id.clone(), tx);

            self.event_bus
                .emit(Event::new(EventKind::AgentQuestion {
                    agent_id: self.id.clone(),
                    question_id: question_id.clone(),
                    question: question.question.clone(),
                    header: question.header.clone(),
                    purpose: question.purpose.clone(),
                    options: question.options.clone(),
                    multiple: question.multiple,
                    allow_custom: question.allow_custom,
                }))
                .await;

            let answer = self
                .execute_with_timeout(async { rx.await }, 120_000, "askUserQuestions")
                .await?
                .map_err(|_| OrchestratorError::PendingRequestTimeout(question_id.clone()))?;
            answers.push(answer);
        }
        Ok(answers)
    }

    /// `spawnSubAgent`: enforces depth and per-agent `maxSubAgents` bounds
    /// before asking the orchestrator to run the sub-agent.
    pub async fn check_can_spawn_sub_agent(&self, max_agent_depth: u8) -> Result<(), OrchestratorError> {
        if self.depth + 1 > max_agent_depth {
            return Err(OrchestratorError::AgentLimitReached(format!(
                "max agent depth {max_agent_depth} reached"
            )));
        }
        let spawned = *self.spawned_sub_agents.read().await;
        if spawned >= self.definition.max_sub_agents {
            return Err(OrchestratorError::AgentLimitReached(format!(
                "agent {} already spawned its {} allotted sub-agents",
                self.id, self.definition.max_sub_agents
            )));
        }
        Ok(())
    }

    pub async fn track_spawned_sub_agent(&self) {
        *self.spawned_sub_agents.write().await += 1;
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// A single tool invocation parsed out of an LLM response by
/// [`parse_tool_call`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub params: Value,
}

/// Extracts a single `<tool>NAME</tool><params>JSON</params>` invocation
/// from assistant content (spec.md §4.4 step 3; the sentinel syntax is
/// specified verbatim for compatibility per spec.md §9). Returns `None` if
/// no tool tag is present, meaning the content is the final reply.
pub fn parse_tool_call(content: &str) -> Option<ParsedToolCall> {
    let tool_start = content.find("<tool>")? + "<tool>".len();
    let tool_end = content[tool_start..].find("</tool>")? + tool_start;
    let name = content[tool_start..tool_end].trim().to_string();

    let params_tag_start = content[tool_end..].find("<params>")? + tool_end + "<params>".len();
    let params_end = content[params_tag_start..].find("</params>")? + params_tag_start;
    let raw_params = content[params_tag_start..params_end].trim();

    // On JSON parse failure, treat the whole body as `{query: <raw>}`
    // (spec.md §4.4 step 4).
    let params = serde_json::from_str(raw_params)
        .unwrap_or_else(|_| serde_json::json!({ "query": raw_params }));

    Some(ParsedToolCall { name, params })
}

/// Truncates tool output for the `agent:tool` `done` event, matching the
/// spec.md §4.4 note that output is truncated in the emitted event.
pub fn truncate_for_event(value: &Value, max_len: usize) -> Value {
    let rendered = value.to_string();
    if rendered.len() <= max_len {
        value.clone()
    } else {
        Value::String(format!("{}… (truncated)", &rendered[..max_len]))
    }
}

/// Options for [`run_tool_calling_loop`].
pub struct ToolLoopOptions {
    pub max_tool_calls: u32,
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ToolLoopOptions {
    fn default() -> Self {
        Self { max_tool_calls: 5, model_id: String::new(), temperature: 0.7, max_tokens: 4096 }
    }
}

/// Result of a tool-calling loop run.
pub struct ToolLoopResult {
    pub content: String,
    pub tokens_used: u32,
    /// Each successfully executed tool call's name and raw output, in call
    /// order, so callers that need more than final prose (e.g. citations)
    /// don't have to re-derive them from `content`.
    pub tool_outputs: Vec<(String, Value)>,
}

/// `callWithTools(messages, allowedTools, opts)` (spec.md §4.4).
///
/// Repeats up to `opts.max_tool_calls` times: call the LLM, extract at most
/// one tool invocation from the sentinel syntax, validate and execute it,
/// then append the assistant's raw content and a synthetic `"Tool result for
/// NAME: ..."` user message before continuing. Terminates at the first
/// non-tool reply, or when the iteration budget is exhausted (in which case
/// the final content is whatever the last turn produced, possibly empty).
pub async fn run_tool_calling_loop(
    handle: &AgentHandle,
    completer: &dyn Completer,
    registry: &ToolRegistry,
    mut messages: Vec<Message>,
    opts: ToolLoopOptions,
) -> Result<ToolLoopResult, OrchestratorError> {
    let mut tokens_used = 0u32;
    let mut last_content = String::new();
    let mut tool_outputs = Vec::new();

    for _ in 0..opts.max_tool_calls {
        let completion_opts = CompletionOptions {
            model_id: opts.model_id.clone(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            ..Default::default()
        };

        let result = completer
            .complete(&messages, &completion_opts)
            .await
            .map_err(|e| OrchestratorError::LlmError { attempts: 1, last_error: e.to_string() })?;

        if let Some(usage) = &result.usage {
            tokens_used += usage.total_tokens;
        }
        last_content = result.content.clone();

        let Some(tool_call) = parse_tool_call(&result.content) else {
            return Ok(ToolLoopResult { content: last_content, tokens_used, tool_outputs });
        };

        let mut args = HashMap::new();
        if let Value::Object(map) = &tool_call.params {
            for (k, v) in map {
                args.insert(k.clone(), v.clone());
            }
        }

        if !handle.can_use_tool(&tool_call.name) {
            handle
                .emit(EventKind::AgentTool {
                    agent_id: handle.id.clone(),
                    tool: tool_call.name.clone(),
                    input: tool_call.params.clone(),
                    status: "done".to_string(),
                    output: Some(serde_json::json!({ "error": "tool not allowed" })),
                    tokens_used: None,
                    duration_ms: Some(0),
                })
                .await;
            messages.push(Message::assistant(result.content.clone()));
            messages.push(Message::user(format!(
                "Tool result for {}: {{\"error\":\"tool not allowed\"}}",
                tool_call.name
            )));
            continue;
        }

        handle
            .emit(EventKind::AgentTool {
                agent_id: handle.id.clone(),
                tool: tool_call.name.clone(),
                input: tool_call.params.clone(),
                status: "running".to_string(),
                output: None,
                tokens_used: None,
                duration_ms: None,
            })
            .await;

        let execution = registry
            .execute(&tool_call.name, args, &handle.definition.tools, &handle.definition.restricted_tools)
            .await;

        let result_text = match execution {
            Ok(exec) => {
                let output = exec
                    .error
                    .as_ref()
                    .map(|e| serde_json::json!({ "error": e }))
                    .unwrap_or_else(|| exec.data.clone().unwrap_or(Value::Null));
                handle
                    .emit(EventKind::AgentTool {
                        agent_id: handle.id.clone(),
                        tool: tool_call.name.clone(),
                        input: tool_call.params.clone(),
                        status: "done".to_string(),
                        output: Some(truncate_for_event(&output, 2000)),
                        tokens_used: None,
                        duration_ms: Some(exec.duration_ms),
                    })
                    .await;
                tool_outputs.push((tool_call.name.clone(), output.clone()));
                output.to_string()
            }
            Err(e) => {
                let output = serde_json::json!({ "error": e.to_string() });
                handle
                    .emit(EventKind::AgentTool {
                        agent_id: handle.id.clone(),
                        tool: tool_call.name.clone(),
                        input: tool_call.params.clone(),
                        status: "done".to_string(),
                        output: Some(output.clone()),
                        tokens_used: None,
                        duration_ms: Some(0),
                    })
                    .await;
                output.to_string()
            }
        };

        messages.push(Message::assistant(result.content.clone()));
        messages.push(Message::user(format!("Tool result for {}: {}", tool_call.name, result_text)));
    }

    Ok(ToolLoopResult { content: last_content, tokens_used, tool_outputs })
}
