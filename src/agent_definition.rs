//! Agent Definition Loader (spec.md §4.3).
//!
//! An agent definition is frontmatter (`name`, `description`, `mode`,
//! `color`, `tools`, …) followed by a plain-text prompt body. Definitions
//! are parsed once per agent type and cached; template rendering substitutes
//! only the `{{key}}` placeholders that exist both in the template and in
//! the supplied context (spec.md testable property 10).

use crate::errors::OrchestratorError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Declarative description of an agent type.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub mode: String,
    pub color: String,
    /// Tool name patterns this agent is allowed to call (wildcard-aware,
    /// see [`crate::tool_protocol::ToolRegistry::is_allowed`]).
    pub tools: Vec<String>,
    pub restricted_tools: Vec<String>,
    pub max_sub_agents: u32,
    /// Prompt body, with `{{key}}` placeholders.
    pub prompt_template: String,
}

const REQUIRED_FIELDS: &[&str] = &["name", "description", "mode", "color", "tools"];

impl AgentDefinition {
    /// Parse a definition from `---\nkey: value\n...\n---\n<body>` frontmatter
    /// text. Fails with [`OrchestratorError::InvalidDefinition`] if any
    /// required field is missing.
    pub fn parse(agent_type: &str, source: &str) -> Result<Self, OrchestratorError> {
        let (frontmatter, body) = split_frontmatter(source)
            .ok_or_else(|| {
                OrchestratorError::InvalidDefinition(
                    agent_type.to_string(),
                    "missing frontmatter block".to_string(),
                )
            })?;

        let fields = parse_frontmatter(frontmatter);

        for required in REQUIRED_FIELDS {
            if !fields.contains_key(*required) {
                return Err(OrchestratorError::InvalidDefinition(
                    agent_type.to_string(),
                    format!("missing required field: {required}"),
                ));
            }
        }

        let tools = fields
            .get("tools")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let restricted_tools = fields
            .get("restricted_tools")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let max_sub_agents = fields
            .get("max_sub_agents")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(AgentDefinition {
            name: fields.get("name").cloned().unwrap_or_default(),
            description: fields.get("description").cloned().unwrap_or_default(),
            mode: fields.get("mode").cloned().unwrap_or_default(),
            color: fields.get("color").cloned().unwrap_or_default(),
            tools,
            restricted_tools,
            max_sub_agents,
            prompt_template: body.trim().to_string(),
        })
    }

    /// Render `prompt_template`, substituting only `{{key}}` placeholders
    /// present in `context`. Unknown placeholders and all non-placeholder
    /// text are left untouched.
    pub fn render(&self, context: &HashMap<String, String>) -> String {
        render_template(&self.prompt_template, context)
    }
}

fn split_frontmatter(source: &str) -> Option<(&str, &str)> {
    let source = source.trim_start();
    let rest = source.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    Some((frontmatter, body))
}

fn parse_frontmatter(block: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    fields
}

/// Substitutes `{{key}}` with `context[key]` only when `key` is present;
/// an absent key is left as literal `{{key}}` text (spec.md testable
/// property 10).
pub fn render_template(template: &str, context: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let key = after_open[..end].trim();
                match context.get(key) {
                    Some(value) => output.push_str(value),
                    None => {
                        output.push_str("{{");
                        output.push_str(&after_open[..end]);
                        output.push_str("}}");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Loads and caches [`AgentDefinition`]s by agent type, parsed once and
/// reused across `run` invocations.
pub struct AgentDefinitionLoader {
    sources: HashMap<String, String>,
    cache: RwLock<HashMap<String, AgentDefinition>>,
}

impl AgentDefinitionLoader {
    pub fn new() -> Self {
        Self { sources: HashMap::new(), cache: RwLock::new(HashMap::new()) }
    }

    /// Register the raw frontmatter+body source for an agent type.
    pub fn register(&mut self, agent_type: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(agent_type.into(), source.into());
    }

    /// Parse (on first use) and return the cached definition for `agent_type`.
    pub fn load(&self, agent_type: &str) -> Result<AgentDefinition, OrchestratorError> {
        if let Some(cached) = self.cache.read().unwrap().get(agent_type) {
            return Ok(cached.clone());
        }

        let source = self
            .sources
            .get(agent_type)
            .ok_or_else(|| OrchestratorError::UnknownAgentType(agent_type.to_string()))?;

        let definition = AgentDefinition::parse(agent_type, source)?;
        self.cache.write().unwrap().insert(agent_type.to_string(), definition.clone());
        Ok(definition)
    }
}

impl Default for AgentDefinitionLoader {
    fn default() -> Self {
        Self::new()
    }
}
