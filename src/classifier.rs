//! Query Classifier (spec.md §4.6).
//!
//! A pure, pattern-based function from raw user text to `{intent,
//! complexity}`. No randomness, no I/O, no LLM call — same input always
//! yields the same output (spec.md testable property 9).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Info,
    Action,
    Repair,
    SystemDiscovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Decline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    pub complexity: Complexity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchStrategy {
    Quick,
    Adaptive,
    Deep,
}

const GREETING_PATTERNS: &[&str] = &[
    "hi", "hi!", "hello", "hey", "thanks", "thank you", "bye", "goodbye", "good morning",
    "good afternoon", "good evening", "how are you", "what's up", "sup",
];

const LINUX_KEYWORDS: &[&str] = &[
    "linux", "ubuntu", "debian", "fedora", "arch", "centos", "rhel", "terminal", "bash", "shell",
    "apt", "dnf", "yum", "pacman", "systemd", "kernel", "sudo", "chmod", "chown", "grep", "ssh",
    "docker", "package", "command", "cli",
];

const NON_LINUX_PATTERNS: &[&str] = &[
    "poem", "joke", "recipe", "write me a story", "write a song", "translate", "weather today",
    "sports score", "math homework", "love letter",
];

const REPAIR_KEYWORDS: &[&str] =
    &["fix", "repair", "troubleshoot", "debug", "broken", "error", "crash", "not working", "fails"];

const SYSTEM_ACTION_PATTERNS: &[&str] = &[
    "install", "uninstall", "remove", "configure", "setup", "set up", "update", "upgrade",
    "start", "stop", "restart", "enable", "disable", "create a", "deploy",
];

const DISCOVERY_PREFIXES: &[&str] =
    &["name=", "pretty_name=", "id=", "version=", "uname", "cat /etc"];

/// `classify(message) -> {intent, complexity}` per spec.md §4.6's ordered
/// rule list; first matching rule wins.
pub fn classify(message: &str) -> Classification {
    let trimmed = message.trim();
    let lower = trimmed.to_lowercase();

    if matches_any(&lower, GREETING_PATTERNS) {
        return Classification { intent: Intent::Info, complexity: Complexity::Simple };
    }

    if trimmed.len() < 100 && is_conversational_followup(&lower) {
        return Classification { intent: Intent::Info, complexity: Complexity::Simple };
    }

    if matches_any(&lower, NON_LINUX_PATTERNS) && !matches_any(&lower, LINUX_KEYWORDS) {
        return Classification { intent: Intent::Info, complexity: Complexity::Decline };
    }

    if matches_any(&lower, SYSTEM_ACTION_PATTERNS) {
        if matches_any(&lower, REPAIR_KEYWORDS) {
            return Classification { intent: Intent::Repair, complexity: Complexity::Complex };
        }
        return Classification { intent: Intent::Action, complexity: Complexity::Complex };
    }

    if starts_with_any(trimmed, DISCOVERY_PREFIXES) || looks_like_discovery_output(trimmed) {
        return Classification {
            intent: Intent::SystemDiscovery,
            complexity: Complexity::Simple,
        };
    }

    Classification { intent: Intent::Info, complexity: Complexity::Moderate }
}

const COMPLEX_TOPIC_PATTERNS: &[&str] =
    &["kubernetes", "docker", "cluster", "error", "kernel panic", "raid", "networking"];

const SHORT_EXPLAIN_PATTERNS: &[&str] = &["what is", "explain", "tell me about"];

const INSTALL_CONFIGURE_KEYWORDS: &[&str] = &["install", "configure", "set up", "setup"];

/// `determineResearchStrategy(query, intent)` (spec.md §4.6).
pub fn determine_research_strategy(query: &str, intent: Intent) -> ResearchStrategy {
    let lower = query.to_lowercase();

    if matches!(intent, Intent::Repair | Intent::Action) || matches_any(&lower, COMPLEX_TOPIC_PATTERNS)
    {
        return ResearchStrategy::Deep;
    }

    if query.trim().len() < 100
        && matches_any(&lower, SHORT_EXPLAIN_PATTERNS)
        && !matches_any(&lower, INSTALL_CONFIGURE_KEYWORDS)
    {
        return ResearchStrategy::Quick;
    }

    ResearchStrategy::Adaptive
}

/// Recognizes pasted `/etc/os-release`-style dumps or `uname -a` output that
/// don't start with one of [`DISCOVERY_PREFIXES`] but still carry at least
/// two `KEY=VALUE` lines — the shape a user gets from piping several
/// discovery commands together.
fn looks_like_discovery_output(text: &str) -> bool {
    static KEY_VALUE_LINE: OnceLock<Regex> = OnceLock::new();
    let re = KEY_VALUE_LINE
        .get_or_init(|| Regex::new(r#"(?m)^[A-Z][A-Z0-9_]*="?[^\n"]*"?$"#).unwrap());
    re.find_iter(text).count() >= 2
}

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

fn starts_with_any(haystack: &str, prefixes: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    prefixes.iter().any(|p| lower.starts_with(p))
}

fn is_conversational_followup(lower: &str) -> bool {
    const FOLLOWUPS: &[&str] =
        &["ok", "okay", "got it", "sounds good", "cool", "nice", "great", "sure", "yes", "no", "yep", "nope"];
    FOLLOWUPS.iter().any(|f| lower == *f || lower.starts_with(&format!("{f} ")) || lower.starts_with(&format!("{f},")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_info_simple() {
        let c = classify("hi");
        assert_eq!(c.intent, Intent::Info);
        assert_eq!(c.complexity, Complexity::Simple);
    }

    #[test]
    fn off_topic_without_linux_keyword_declines() {
        let c = classify("write me a poem about cats");
        assert_eq!(c.complexity, Complexity::Decline);
    }

    #[test]
    fn off_topic_mentioning_linux_does_not_decline() {
        let c = classify("write me a poem about linux kernels");
        assert_ne!(c.complexity, Complexity::Decline);
    }

    #[test]
    fn install_request_is_action_complex() {
        let c = classify("install nginx on Ubuntu 22.04");
        assert_eq!(c.intent, Intent::Action);
        assert_eq!(c.complexity, Complexity::Complex);
    }

    #[test]
    fn broken_system_is_repair_complex() {
        let c = classify("fix my broken boot");
        assert_eq!(c.intent, Intent::Repair);
        assert_eq!(c.complexity, Complexity::Complex);
    }

    #[test]
    fn discovery_output_is_recognized() {
        let c = classify("NAME=\"Ubuntu\"\nVERSION=\"22.04\"");
        assert_eq!(c.intent, Intent::SystemDiscovery);
        assert_eq!(c.complexity, Complexity::Simple);
    }

    #[test]
    fn multiline_os_release_dump_is_recognized_without_prefix_match() {
        let c = classify("FOO=bar\nPRETTY_NAME=\"Fedora Linux 40\"\nVERSION_ID=40");
        assert_eq!(c.intent, Intent::SystemDiscovery);
        assert_eq!(c.complexity, Complexity::Simple);
    }

    #[test]
    fn default_falls_to_info_moderate() {
        let c = classify("what is systemd?");
        assert_eq!(c.intent, Intent::Info);
        assert_eq!(c.complexity, Complexity::Moderate);
    }

    #[test]
    fn classify_is_pure_and_deterministic() {
        let a = classify("what is systemd?");
        let b = classify("what is systemd?");
        assert_eq!(a, b);
    }

    #[test]
    fn research_strategy_quick_for_short_explain_without_action_keywords() {
        let strategy = determine_research_strategy("what is systemd?", Intent::Info);
        assert_eq!(strategy, ResearchStrategy::Quick);
    }

    #[test]
    fn research_strategy_deep_for_repair() {
        let strategy = determine_research_strategy("fix my broken boot", Intent::Repair);
        assert_eq!(strategy, ResearchStrategy::Deep);
    }
}
