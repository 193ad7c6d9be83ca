//! End-to-end scenario coverage for `Orchestrator::process` (spec.md §8).
//!
//! S1/S2 (greeting, decline) are covered as unit tests alongside
//! `Orchestrator` itself, since they need no agent definitions or tool
//! registry. These scenarios exercise the multi-agent pipelines, which need
//! a fuller set of test doubles: a call-count-scripted `Completer`, a
//! `Store` that actually retains a written system profile, and a
//! `ToolRegistry` with a `validate_command` handler.

use async_trait::async_trait;
use orito_core::agent_definition::AgentDefinitionLoader;
use orito_core::client_wrapper::{
    Completer, CompletionOptions, CompletionResult, Message, TokenUsage,
};
use orito_core::config::OrchestratorConfig;
use orito_core::errors::BoxError;
use orito_core::event::{EventBus, EventKind};
use orito_core::model_selector::{ModelCatalog, ModelSelector};
use orito_core::orchestrator::{Orchestrator, OrchestratorDeps};
use orito_core::profile;
use orito_core::store::{
    AuditLogEntry, Chat, ChatContext, LegacySystemProfile, Store, SystemProfileData,
    UserPreferences,
};
use orito_core::tool_protocol::{FnHandler, ToolHandler, ToolParameter, ToolParameterType, ToolRegistry, ToolSchema};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const RESEARCH_DEF: &str = "---\nname: Research Agent\ndescription: Gathers citations.\nmode: autonomous\ncolor: blue\ntools: web_search, search_wikipedia\nmax_sub_agents: 2\n---\nYou are researching {{task}}.\n";
const PLANNER_DEF: &str = "---\nname: Planner Agent\ndescription: Builds an action plan.\nmode: autonomous\ncolor: purple\ntools: calculate, search_packages\n---\nPlan for {{task}}, given: {{researchSummary}}.\n";
const VALIDATOR_DEF: &str = "---\nname: Validator Agent\ndescription: Validates planned commands.\nmode: deterministic\ncolor: orange\ntools: validate_command\n---\nValidate commands.\n";
const SYNTHESIZER_DEF: &str = "---\nname: Synthesizer Agent\ndescription: Writes the final reply.\nmode: autonomous\ncolor: green\ntools: \n---\nSynthesize a response for {{task}}.\n";
const CURIOUS_DEF: &str = "---\nname: System Profile Collector\ndescription: Elicits missing system details.\nmode: interactive\ncolor: yellow\ntools: \n---\nCollect the user's system profile.\n";

fn definitions() -> AgentDefinitionLoader {
    let mut loader = AgentDefinitionLoader::new();
    loader.register("research", RESEARCH_DEF);
    loader.register("planner", PLANNER_DEF);
    loader.register("validator", VALIDATOR_DEF);
    loader.register("synthesizer", SYNTHESIZER_DEF);
    loader.register("curious", CURIOUS_DEF);
    loader
}

fn catalog() -> ModelCatalog {
    ModelCatalog {
        reasoning_model: "reasoning-large".into(),
        coding_model: "code-specialist".into(),
        tool_small_model: "tool-small".into(),
        long_context_model: "long-context".into(),
        balanced_model: "balanced".into(),
        fast_agent_model: "fast-agent".into(),
        fallback_order: vec!["balanced".into(), "fast-agent".into()],
    }
}

/// Returns each entry of `responses` in order, one per `complete` call,
/// independent of which agent or message history triggered it — the
/// orchestrator's pipelines call out strictly in sequence within one
/// `process` invocation, so ordinal scripting is enough to drive any
/// scenario.
struct ScriptedCompleter {
    responses: Vec<&'static str>,
    call_count: AtomicUsize,
}

impl ScriptedCompleter {
    fn new(responses: Vec<&'static str>) -> Self {
        Self { responses, call_count: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(
        &self,
        _messages: &[Message],
        _opts: &CompletionOptions,
    ) -> Result<CompletionResult, BoxError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let content = self.responses.get(idx).copied().unwrap_or_default().to_string();
        Ok(CompletionResult {
            content,
            tool_calls: vec![],
            model_used: "scripted".to_string(),
            usage: Some(TokenUsage { prompt_tokens: 10, completion_tokens: 10, total_tokens: 20 }),
        })
    }
}

/// A `Store` double that actually retains whatever profile is written via
/// `update_chat_system_profile`, so tests can drive the deferred-answer
/// round trip (S5) end to end.
struct ProfileStore {
    profile: Mutex<Option<SystemProfileData>>,
}

impl ProfileStore {
    fn empty() -> Self {
        Self { profile: Mutex::new(None) }
    }

    fn seeded(profile: SystemProfileData) -> Self {
        Self { profile: Mutex::new(Some(profile)) }
    }
}

#[async_trait]
impl Store for ProfileStore {
    async fn find_chat_by_id(&self, chat_id: &str) -> Result<Option<Chat>, BoxError> {
        let system_profile = self.profile.lock().unwrap().clone();
        Ok(Some(Chat {
            id: chat_id.to_string(),
            context: ChatContext { system_profile },
            system_profile: None,
        }))
    }

    async fn update_chat_system_profile(
        &self,
        _chat_id: &str,
        profile: &SystemProfileData,
        _legacy: &LegacySystemProfile,
    ) -> Result<(), BoxError> {
        *self.profile.lock().unwrap() = Some(profile.clone());
        Ok(())
    }

    async fn append_audit_log(&self, _entry: AuditLogEntry) -> Result<(), BoxError> {
        Ok(())
    }

    async fn find_preferences_by_user_id(
        &self,
        _user_id: &str,
    ) -> Result<Option<UserPreferences>, BoxError> {
        Ok(None)
    }
}

fn ubuntu_profile() -> SystemProfileData {
    SystemProfileData {
        distro: "Ubuntu".to_string(),
        version: "22.04".to_string(),
        package_manager: "apt".to_string(),
        shell: "bash".to_string(),
        desktop_environment: "GNOME".to_string(),
        detected_at: chrono::Utc::now(),
    }
}

fn validate_command_registry(blocked: Option<&'static str>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(
        ToolSchema::new("validate_command", "checks a command before it runs")
            .with_parameter(ToolParameter::new("command", ToolParameterType::String).required()),
        Arc::new(FnHandler(move |args: HashMap<String, serde_json::Value>| async move {
            let command = args.get("command").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if Some(command.as_str()) == blocked {
                Ok(serde_json::json!({ "blocked": true, "reason": "destructive without confirmation" }))
            } else {
                Ok(serde_json::json!({ "blocked": false }))
            }
        })) as Arc<dyn ToolHandler>,
    );
    registry
}

fn agent_spawn_types(events: &[orito_core::event::Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::AgentSpawn { agent_type, .. } => Some(agent_type.clone()),
            _ => None,
        })
        .collect()
}

async fn drain(rx: &mut tokio::sync::broadcast::Receiver<orito_core::event::Event>) -> Vec<orito_core::event::Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn web_search_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(
        ToolSchema::new("web_search", "search the web")
            .with_parameter(ToolParameter::new("query", ToolParameterType::String).required()),
        Arc::new(FnHandler(|_args: HashMap<String, serde_json::Value>| async move {
            Ok(serde_json::json!({
                "results": [
                    {"title": "systemd", "url": "https://example.com/systemd", "snippet": "init system"}
                ]
            }))
        })) as Arc<dyn ToolHandler>,
    );
    registry
}

#[tokio::test]
async fn s3_moderate_query_spawns_research_then_synthesizer_with_no_commands() {
    let completer = Arc::new(ScriptedCompleter::new(vec![
        "<tool>web_search</tool><params>{\"query\":\"what is systemd\"}</params>",
        "systemd is the init system used by most modern Linux distributions.",
        "systemd manages services, sockets, and boot ordering.",
    ]));
    let deps = OrchestratorDeps {
        completer: completer.clone(),
        store: Arc::new(ProfileStore::empty()),
        tool_registry: Arc::new(web_search_registry()),
        definitions: Arc::new(definitions()),
        model_selector: Arc::new(ModelSelector::new(catalog())),
    };
    let orch = Orchestrator::new(
        "chat-s3",
        "session-s3",
        None,
        OrchestratorConfig::default(),
        deps,
        Arc::new(EventBus::new()),
    );
    let mut rx = orch.subscribe();

    let outcome = orch.process("what is systemd?").await.unwrap();

    let events = drain(&mut rx).await;
    assert_eq!(agent_spawn_types(&events), vec!["research".to_string(), "synthesizer".to_string()]);
    assert!(outcome.commands.is_empty());
    assert_eq!(outcome.citations.len(), 1);
    assert_eq!(outcome.citations[0]["title"].as_str(), Some("systemd"));
}

#[tokio::test]
async fn s4_complex_action_with_profile_spawns_full_pipeline_and_surfaces_apt_command() {
    let completer = Arc::new(ScriptedCompleter::new(vec![
        "Nginx is a popular web server package available via apt on Ubuntu.",
        r#"{"steps":["Update the package index","Install nginx"],"commands":[{"command":"sudo apt install -y nginx","privilege_level":"root","risk":"medium","risk_explanation":"installs and enables a network-facing service","dry_run_hint":"sudo apt install -y --simulate nginx","expected_output":null,"citations":[]}],"prerequisites":[],"troubleshooting":[]}"#,
        "Here's how to get nginx running on Ubuntu.",
    ]));
    let deps = OrchestratorDeps {
        completer: completer.clone(),
        store: Arc::new(ProfileStore::seeded(ubuntu_profile())),
        tool_registry: Arc::new(validate_command_registry(None)),
        definitions: Arc::new(definitions()),
        model_selector: Arc::new(ModelSelector::new(catalog())),
    };
    let orch = Arc::new(Orchestrator::new(
        "chat-s4",
        "session-s4",
        None,
        OrchestratorConfig::default(),
        deps,
        Arc::new(EventBus::new()),
    ));
    let mut rx = orch.subscribe();

    let orch_for_task = orch.clone();
    let process_task =
        tokio::spawn(async move { orch_for_task.process("install nginx on Ubuntu 22.04").await.unwrap() });

    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.unwrap();
        if let EventKind::AgentQuestion { question_id, .. } = &event.kind {
            orch.resolve_user_answer(question_id, "yes".to_string()).await;
            events.push(event);
            break;
        }
        events.push(event);
    }

    let outcome = process_task.await.unwrap();
    events.extend(drain(&mut rx).await);
    assert_eq!(
        agent_spawn_types(&events),
        vec![
            "curious".to_string(),
            "research".to_string(),
            "planner".to_string(),
            "validator".to_string(),
            "synthesizer".to_string()
        ]
    );

    assert!(outcome.commands.iter().any(|c| {
        c["command"].as_str().map(|cmd| cmd.starts_with("apt") || cmd.starts_with("sudo apt")).unwrap_or(false)
    }));
}

#[tokio::test]
async fn s5_deferred_action_asks_five_questions_then_reprocesses_as_complex_pipeline() {
    let completer = Arc::new(ScriptedCompleter::new(vec![
        "A broken boot is usually a GRUB or initramfs problem.",
        r#"{"steps":["Boot into recovery mode","Inspect the GRUB configuration"],"commands":[{"command":"sudo update-grub","privilege_level":"root","risk":"medium","risk_explanation":"rewrites the boot configuration","dry_run_hint":null,"expected_output":null,"citations":[]}],"prerequisites":[],"troubleshooting":["If the system still fails to boot, reinstall grub-pc"]}"#,
        "Let's get your boot working again.",
    ]));
    let store = Arc::new(ProfileStore::empty());
    let deps = OrchestratorDeps {
        completer: completer.clone(),
        store: store.clone(),
        tool_registry: Arc::new(ToolRegistry::new()),
        definitions: Arc::new(definitions()),
        model_selector: Arc::new(ModelSelector::new(catalog())),
    };
    let orch = Arc::new(Orchestrator::new(
        "chat-s5",
        "session-s5",
        None,
        OrchestratorConfig::default(),
        deps,
        Arc::new(EventBus::new()),
    ));
    let mut rx = orch.subscribe();

    let orch_for_task = orch.clone();
    let process_task =
        tokio::spawn(async move { orch_for_task.process("fix my broken boot").await.unwrap() });

    let answers = ["Ubuntu", "22.04", "apt", "bash", "GNOME"];
    let mut asked_fields = Vec::new();
    let mut questions_answered = 0;
    while questions_answered < answers.len() {
        let event = rx.recv().await.unwrap();
        if let EventKind::AgentQuestion { question_id, question, .. } = event.kind {
            asked_fields.push(question);
            orch.resolve_user_answer(&question_id, answers[questions_answered].to_string()).await;
            questions_answered += 1;
        }
    }

    let gated_outcome = process_task.await.unwrap();
    assert!(gated_outcome.response.is_empty() || gated_outcome.commands.is_empty());

    assert_eq!(asked_fields.len(), 5);
    assert!(asked_fields[0].to_lowercase().contains("distribution"));
    assert!(asked_fields[2].to_lowercase().contains("package manager"));
    assert!(asked_fields[4].to_lowercase().contains("desktop environment"));

    let mut normalized = HashMap::new();
    normalized.insert("distro", "Ubuntu".to_string());
    normalized.insert("version", "22.04".to_string());
    normalized.insert("packageManager", "apt".to_string());
    normalized.insert("shell", "bash".to_string());
    normalized.insert("desktopEnvironment", "GNOME".to_string());
    let profile = profile::normalize_answers(&normalized);

    let resumed = orch.update_system_profile(profile).await.unwrap();
    let resumed = resumed.expect("a deferred query should have been re-processed");
    assert!(!resumed.response.is_empty());
}

#[tokio::test]
async fn s6_blocked_command_is_excluded_from_commands_and_noted_in_the_guide() {
    let completer = Arc::new(ScriptedCompleter::new(vec![
        "Wiping the root filesystem is never the right fix for a broken boot.",
        r#"{"steps":["Do not run this"],"commands":[{"command":"rm -rf /","privilege_level":"root","risk":"high","risk_explanation":"destroys the entire filesystem","dry_run_hint":null,"expected_output":null,"citations":[]}],"prerequisites":[],"troubleshooting":[]}"#,
        "I'm not going to run that command for you.",
    ]));
    let deps = OrchestratorDeps {
        completer: completer.clone(),
        store: Arc::new(ProfileStore::seeded(ubuntu_profile())),
        tool_registry: Arc::new(validate_command_registry(Some("rm -rf /"))),
        definitions: Arc::new(definitions()),
        model_selector: Arc::new(ModelSelector::new(catalog())),
    };
    let orch = Arc::new(Orchestrator::new(
        "chat-s6",
        "session-s6",
        None,
        OrchestratorConfig::default(),
        deps,
        Arc::new(EventBus::new()),
    ));
    let mut rx = orch.subscribe();

    let orch_for_task = orch.clone();
    let process_task = tokio::spawn(async move {
        orch_for_task.process("delete everything on this broken system").await.unwrap()
    });

    loop {
        let event = rx.recv().await.unwrap();
        if let EventKind::AgentQuestion { question_id, .. } = &event.kind {
            orch.resolve_user_answer(question_id, "yes".to_string()).await;
            break;
        }
    }

    let outcome = process_task.await.unwrap();

    assert!(outcome.commands.is_empty());
    assert!(outcome.response.contains("Blocked Commands"));
    assert!(outcome.response.contains("destructive without confirmation"));
}
