//! Tool Registry & Schemas (spec.md §4.1).
//!
//! A tool is a name, a description, a JSON-schema-ish parameter list, and an
//! async handler. The [`ToolRegistry`] maps names to handlers and enforces
//! the allow/restrict wildcard policy before dispatch — handlers themselves
//! never see a name they weren't permitted to run under.
//!
//! Concrete tool implementations (web search, wiki, calculator, manpage
//! lookup, package search, command validator) are out of scope for this
//! crate (spec.md §1) — applications register their own handlers via
//! [`ToolRegistry::register`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self { success: true, output, error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, output: serde_json::Value::Null, error: Some(error.into()) }
    }
}

/// JSON-schema-like type tag for a tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Boolean,
    Array,
}

/// A single parameter in a tool's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
    /// For `Array` parameters, the type of the contained items.
    pub items: Option<Box<ToolParameterType>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            enum_values: None,
            items: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum(mut self, values: Vec<String>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_items(mut self, item_type: ToolParameterType) -> Self {
        self.items = Some(Box::new(item_type));
        self
    }
}

/// Declarative description of a tool, as returned by [`ToolRegistry::get_definition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), parameters: Vec::new() }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Names of parameters marked `required`.
    pub fn required_names(&self) -> Vec<&str> {
        self.parameters.iter().filter(|p| p.required).map(|p| p.name.as_str()).collect()
    }
}

/// Errors raised during tool dispatch. These are never propagated as Rust
/// errors into the tool-calling loop — the loop catches them and reinjects
/// the message as a tool result so the LLM can recover (spec.md §4.1).
#[derive(Debug, Clone)]
pub enum ToolDispatchError {
    UnknownTool(String),
    NotAllowed(String),
    HandlerFailed(String),
}

impl fmt::Display for ToolDispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolDispatchError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            ToolDispatchError::NotAllowed(name) => write!(f, "tool not allowed: {name}"),
            ToolDispatchError::HandlerFailed(msg) => write!(f, "tool handler failed: {msg}"),
        }
    }
}

impl Error for ToolDispatchError {}

/// Outcome of [`ToolRegistry::execute`], including wall-clock duration for
/// the `agent:tool` event's `durationMs` field.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// An async tool handler: a validated `{string -> Value}` argument map in,
/// an arbitrary JSON-serializable value out.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;
}

/// Adapts a plain async closure into a [`ToolHandler`], mirroring the
/// closure-based tool registration convenience the teacher crate offers for
/// its `CustomToolProtocol`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(HashMap<String, serde_json::Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, Box<dyn Error + Send + Sync>>>
        + Send,
{
    async fn call(
        &self,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        (self.0)(args).await
    }
}

/// Maps tool names to schemas and handlers, and enforces per-agent
/// allow/restrict wildcard policy before dispatch.
///
/// Wildcard matching (spec.md §4.1): the pattern `*` matches everything; a
/// trailing `*` (e.g. `search_*`) matches by prefix; anything in `restricted`
/// denies regardless of what `allowed` says.
#[derive(Default)]
pub struct ToolRegistry {
    schemas: HashMap<String, ToolSchema>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { schemas: HashMap::new(), handlers: HashMap::new() }
    }

    /// Register a tool's schema and handler under `schema.name`.
    pub fn register(&mut self, schema: ToolSchema, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(schema.name.clone(), handler);
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Look up a tool's declarative schema.
    pub fn get_definition(&self, name: &str) -> Option<&ToolSchema> {
        self.schemas.get(name)
    }

    /// All registered schemas, for building the "tools available" prompt
    /// section the agent runtime appends to its first LLM call.
    pub fn list_schemas(&self) -> Vec<&ToolSchema> {
        self.schemas.values().collect()
    }

    /// Whether `name` is permitted under the given allow/restrict policy.
    pub fn is_allowed(name: &str, allowed: &[String], restricted: &[String]) -> bool {
        if restricted.iter().any(|r| wildcard_match(r, name)) {
            return false;
        }
        allowed.iter().any(|a| wildcard_match(a, name))
    }

    /// Validate arguments against `schema.parameters.required`, then dispatch
    /// to the registered handler. Returns timing for event emission either
    /// way.
    pub async fn execute(
        &self,
        name: &str,
        args: HashMap<String, serde_json::Value>,
        allowed: &[String],
        restricted: &[String],
    ) -> Result<ToolExecution, ToolDispatchError> {
        let start = Instant::now();

        if !Self::is_allowed(name, allowed, restricted) {
            return Err(ToolDispatchError::NotAllowed(name.to_string()));
        }

        let schema =
            self.schemas.get(name).ok_or_else(|| ToolDispatchError::UnknownTool(name.to_string()))?;
        let handler =
            self.handlers.get(name).ok_or_else(|| ToolDispatchError::UnknownTool(name.to_string()))?;

        for required in schema.required_names() {
            if !args.contains_key(required) {
                return Ok(ToolExecution {
                    data: None,
                    error: Some(format!("missing required parameter: {required}")),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        }

        match handler.call(args).await {
            Ok(value) => Ok(ToolExecution {
                data: Some(value),
                error: None,
                duration_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => Ok(ToolExecution {
                data: None,
                error: Some(e.to_string()),
                duration_ms: start.elapsed().as_millis() as u64,
            }),
        }
    }
}

/// `*` matches everything; a trailing `*` matches by prefix; otherwise exact
/// match.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}
