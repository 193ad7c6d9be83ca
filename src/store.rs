//! Persistence capability (spec.md §6.3).
//!
//! Chat, audit-log, and user-preference storage are out of scope for this
//! crate (spec.md §1) — applications implement [`Store`] over whatever
//! database they use. This module only defines the shapes the orchestrator
//! reads and writes.

use crate::errors::BoxError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized Linux system descriptor, persisted on the chat record
/// (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemProfileData {
    pub distro: String,
    pub version: String,
    pub package_manager: String,
    pub shell: String,
    pub desktop_environment: String,
    pub detected_at: DateTime<Utc>,
}

/// Legacy-shaped mirror of [`SystemProfileData`], with unknown fields left
/// `None` rather than defaulted, for compatibility with older chat records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LegacySystemProfile {
    pub distro: Option<String>,
    pub version: Option<String>,
    pub package_manager: Option<String>,
    pub shell: Option<String>,
    pub desktop_environment: Option<String>,
}

/// Context carried on a chat record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatContext {
    pub system_profile: Option<SystemProfileData>,
}

/// A single chat record, as `Store::find_chat_by_id` returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub context: ChatContext,
    /// Legacy top-level mirror of `context.system_profile`, kept for
    /// backward-compatible readers (spec.md §4.7 persistence note).
    pub system_profile: Option<LegacySystemProfile>,
}

/// One audit-log entry (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub chat_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    /// Unique per-entry identifier, used to detect duplicate appends.
    pub action_id: String,
    pub command: String,
    pub risk: String,
    pub user_decision: Option<String>,
    pub hmac: String,
    pub created_at: DateTime<Utc>,
    pub details: Value,
}

/// Per-user response preferences (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub default_distro: Option<String>,
    pub default_shell: Option<String>,
    pub font_size: Option<u32>,
    pub response_style: Option<String>,
    pub custom_instructions: Option<String>,
}

impl UserPreferences {
    /// Renders the subset of preferences relevant to prompt construction,
    /// mirroring the source's `getSystemConfiguration()` accessor.
    pub fn system_configuration(&self) -> String {
        let mut lines = Vec::new();
        if let Some(distro) = &self.default_distro {
            lines.push(format!("Preferred distro: {distro}"));
        }
        if let Some(shell) = &self.default_shell {
            lines.push(format!("Preferred shell: {shell}"));
        }
        if let Some(style) = &self.response_style {
            lines.push(format!("Response style: {style}"));
        }
        if let Some(custom) = &self.custom_instructions {
            lines.push(format!("Custom instructions: {custom}"));
        }
        lines.join("\n")
    }
}

/// Persistence capability the orchestrator depends on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_chat_by_id(&self, chat_id: &str) -> Result<Option<Chat>, BoxError>;

    /// Sets `context.system_profile` and the legacy `system_profile` mirror.
    async fn update_chat_system_profile(
        &self,
        chat_id: &str,
        profile: &SystemProfileData,
        legacy: &LegacySystemProfile,
    ) -> Result<(), BoxError>;

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), BoxError>;

    async fn find_preferences_by_user_id(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPreferences>, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_configuration_joins_only_present_fields() {
        let prefs = UserPreferences {
            user_id: "u1".into(),
            default_distro: Some("Ubuntu".into()),
            default_shell: None,
            font_size: None,
            response_style: Some("concise".into()),
            custom_instructions: None,
        };

        let config = prefs.system_configuration();
        assert!(config.contains("Ubuntu"));
        assert!(config.contains("concise"));
        assert!(!config.contains("shell"));
    }
}
