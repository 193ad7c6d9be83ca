//! Configuration for the orchestration core.
//!
//! Provides [`OrchestratorConfig`] for tuning concurrency, agent defaults,
//! and orchestrator-level retry/fallback behavior. Users construct this
//! manually — no file-parsing dependencies are introduced; reading from
//! environment variables is the embedding application's job (spec.md §6.6).
//!
//! # Example
//!
//! ```rust
//! use orito_core::config::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::default();
//! assert_eq!(config.agent_defaults.max_retries, 3);
//! ```

use std::collections::HashMap;

/// Circuit breaker tuning (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 60_000 }
    }
}

/// Per-agent defaults (spec.md §6.6).
#[derive(Debug, Clone, Copy)]
pub struct AgentDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Orchestrator-level defaults (spec.md §6.6).
#[derive(Debug, Clone)]
pub struct OrchestratorDefaults {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub agent_timeout_ms: u64,
    pub enable_graceful_degradation: bool,
    pub enable_model_selection: bool,
    pub default_model: String,
}

impl Default for OrchestratorDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            agent_timeout_ms: 120_000,
            enable_graceful_degradation: true,
            enable_model_selection: true,
            default_model: "balanced".to_string(),
        }
    }
}

/// Cache tuning for completion/search caches (owned by the host application;
/// this crate does not implement a cache, only carries the dial per spec.md
/// §1's explicit Non-goal on cache implementations).
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1_000, ttl_ms: 5 * 60 * 1_000 }
    }
}

/// Top-level configuration passed into the orchestrator at construction.
///
/// This struct is intentionally minimal and users construct it however they
/// want; no TOML/YAML/env parsing is performed here.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrently-live agents per tier (spec.md §5 `TIER_LIMITS`).
    /// Keyed by tier name (e.g. `"simple"`, `"moderate"`, `"complex"`).
    pub tier_limits: HashMap<String, u32>,
    pub agent_defaults: AgentDefaults,
    pub orchestrator_defaults: OrchestratorDefaults,
    pub cache: CacheConfig,
    pub max_agent_depth: u8,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut tier_limits = HashMap::new();
        tier_limits.insert("simple".to_string(), 4);
        tier_limits.insert("moderate".to_string(), 3);
        tier_limits.insert("complex".to_string(), 2);

        Self {
            tier_limits,
            agent_defaults: AgentDefaults::default(),
            orchestrator_defaults: OrchestratorDefaults::default(),
            cache: CacheConfig::default(),
            max_agent_depth: 2,
        }
    }
}

impl OrchestratorConfig {
    pub fn max_concurrent_for_tier(&self, tier: &str) -> u32 {
        self.tier_limits.get(tier).copied().unwrap_or(1)
    }
}
