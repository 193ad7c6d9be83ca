//! Model Selector (spec.md §4.2).
//!
//! A pure, priority-rule waterfall mapping a [`TaskContext`] to a model id,
//! a fallback chain, and per-model completion defaults. The set of concrete
//! models and their ordering is configuration (spec.md §9 Open Questions),
//! not part of this contract — callers supply it via [`ModelCatalog`].

use serde::{Deserialize, Serialize};

/// How urgently the caller wants a response, trading latency for quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Fast,
    Balanced,
    Thorough,
}

/// Classifier-assigned complexity tier, reused from [`crate::classifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Everything the selector needs to know about the task at hand.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub query: String,
    pub requires_tools: bool,
    pub tool_count: u32,
    pub requires_coding: bool,
    pub requires_deep_reasoning: bool,
    pub requires_long_context: bool,
    pub estimated_context_size: u32,
    pub urgency: Urgency,
    pub complexity: Complexity,
    /// Explicit user/preference override, checked first (priority rule 1).
    pub preferred_model: Option<String>,
}

/// Rough latency class attached to a selection, for UI hinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedLatency {
    Fast,
    Medium,
    Slow,
}

/// Output of [`ModelSelector::select`].
#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub selected_model: String,
    pub confidence: f32,
    pub reasoning: String,
    pub fallback_chain: Vec<String>,
    pub estimated_latency: EstimatedLatency,
}

/// Per-model completion defaults returned by [`ModelSelector::get_optimal_params`].
#[derive(Debug, Clone, Copy)]
pub struct ModelParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self { temperature: 0.7, top_p: 1.0, max_tokens: 4096 }
    }
}

/// The configured universe of model ids the selector chooses among. The
/// specific model names are a deployment concern (spec.md §9); this crate
/// only needs the five functional roles to implement the priority rules.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub reasoning_model: String,
    pub coding_model: String,
    pub tool_small_model: String,
    pub long_context_model: String,
    pub balanced_model: String,
    pub fast_agent_model: String,
    /// Order tried after `selected_model` fails; `selected_model` is
    /// prepended and de-duplicated by [`ModelSelector::select`].
    pub fallback_order: Vec<String>,
}

impl ModelCatalog {
    fn params_table(&self) -> Vec<(&str, ModelParams)> {
        vec![
            (&self.reasoning_model, ModelParams { temperature: 0.3, top_p: 0.9, max_tokens: 8192 }),
            (&self.coding_model, ModelParams { temperature: 0.2, top_p: 0.95, max_tokens: 8192 }),
            (&self.tool_small_model, ModelParams { temperature: 0.5, top_p: 1.0, max_tokens: 2048 }),
            (&self.long_context_model, ModelParams { temperature: 0.5, top_p: 1.0, max_tokens: 4096 }),
            (&self.balanced_model, ModelParams { temperature: 0.7, top_p: 1.0, max_tokens: 4096 }),
            (&self.fast_agent_model, ModelParams { temperature: 0.7, top_p: 1.0, max_tokens: 2048 }),
        ]
    }
}

/// Threshold past which context is considered "long" (spec.md §4.2).
pub const LONG_CONTEXT_TOKENS: u32 = 128_000;

/// Heuristic selector implementing the spec.md §4.2 priority waterfall.
pub struct ModelSelector {
    catalog: ModelCatalog,
}

impl ModelSelector {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self { catalog }
    }

    /// Run the priority rules (first match wins) and build the fallback chain.
    pub fn select(&self, ctx: &TaskContext) -> ModelSelection {
        let (selected, confidence, reasoning, latency) = self.apply_rules(ctx);
        let fallback_chain = self.build_fallback_chain(&selected);

        ModelSelection {
            selected_model: selected,
            confidence,
            reasoning,
            fallback_chain,
            estimated_latency: latency,
        }
    }

    fn apply_rules(&self, ctx: &TaskContext) -> (String, f32, String, EstimatedLatency) {
        if let Some(preferred) = &ctx.preferred_model {
            return (
                preferred.clone(),
                1.0,
                "explicit user-preferred model".to_string(),
                EstimatedLatency::Medium,
            );
        }

        if ctx.requires_deep_reasoning && ctx.urgency == Urgency::Thorough {
            return (
                self.catalog.reasoning_model.clone(),
                0.9,
                "deep reasoning requested under thorough urgency".to_string(),
                EstimatedLatency::Slow,
            );
        }

        if ctx.requires_coding || has_coding_keywords(&ctx.query) {
            return (
                self.catalog.coding_model.clone(),
                0.85,
                "coding task detected".to_string(),
                EstimatedLatency::Medium,
            );
        }

        if ctx.requires_tools && ctx.urgency == Urgency::Fast && ctx.tool_count > 0 {
            return (
                self.catalog.tool_small_model.clone(),
                0.8,
                "fast tool-using task".to_string(),
                EstimatedLatency::Fast,
            );
        }

        if ctx.requires_long_context || ctx.estimated_context_size > LONG_CONTEXT_TOKENS {
            return (
                self.catalog.long_context_model.clone(),
                0.75,
                "long context required".to_string(),
                EstimatedLatency::Medium,
            );
        }

        if ctx.requires_tools && ctx.tool_count > 1 {
            return (
                self.catalog.tool_small_model.clone(),
                0.65,
                "complex toolchain".to_string(),
                EstimatedLatency::Medium,
            );
        }

        if matches!(ctx.complexity, Complexity::Complex | Complexity::Moderate) {
            return (
                self.catalog.balanced_model.clone(),
                0.6,
                "general-purpose task of moderate or higher complexity".to_string(),
                EstimatedLatency::Medium,
            );
        }

        (
            self.catalog.fast_agent_model.clone(),
            0.5,
            "default fast path".to_string(),
            EstimatedLatency::Fast,
        )
    }

    fn build_fallback_chain(&self, selected: &str) -> Vec<String> {
        let mut chain = vec![selected.to_string()];
        for candidate in &self.catalog.fallback_order {
            if !chain.contains(candidate) {
                chain.push(candidate.clone());
            }
        }
        chain
    }

    /// Next untried model in `chain`, or `None` if all have been attempted.
    pub fn get_next_fallback(chain: &[String], attempted: &[String]) -> Option<String> {
        chain.iter().find(|m| !attempted.contains(m)).cloned()
    }

    /// Per-model completion defaults; falls back to library defaults for an
    /// unrecognized model id rather than failing the call.
    pub fn get_optimal_params(&self, model: &str) -> ModelParams {
        self.catalog
            .params_table()
            .into_iter()
            .find(|(name, _)| *name == model)
            .map(|(_, params)| params)
            .unwrap_or_default()
    }
}

fn has_coding_keywords(query: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "write a script", "write code", "function", "class ", "compile", "debug this code",
        "refactor", "algorithm", "regex", "python script", "bash script", "shell script",
    ];
    let lower = query.to_lowercase();
    KEYWORDS.iter().any(|k| lower.contains(k))
}
