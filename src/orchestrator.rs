//! Orchestrator (spec.md §4.8).
//!
//! Owns pipeline selection, agent lifecycle, sub-agent routing, event
//! fan-out, the deferred-query slot, and model-failure fallback. `process`
//! is the single entry point for a turn.

use crate::agent::{AgentHandle, PendingQuestion};
use crate::agent_definition::AgentDefinitionLoader;
use crate::agents::curious;
use crate::agents::planner;
use crate::agents::research;
use crate::agents::synthesizer::{self, SynthesisInput};
use crate::agents::validator;
use crate::classifier::{self, Complexity, Intent};
use crate::client_wrapper::{Completer, CompletionOptions, Message};
use crate::config::OrchestratorConfig;
use crate::errors::OrchestratorError;
use crate::event::{AgentMetricSummary, Event, EventBus, EventKind};
use crate::model_selector::{ModelSelection, ModelSelector, TaskContext};
use crate::profile;
use crate::store::{AuditLogEntry, LegacySystemProfile, Store, SystemProfileData, UserPreferences};
use crate::tool_protocol::ToolRegistry;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

/// The literal decline text wire contract (spec.md §6.7). Every decline
/// turn emits this verbatim; the surrounding topic list is fixed here since
/// the "external resource file" the spec gestures at is a deployment detail,
/// not a contract this crate needs to source externally.
pub const DECLINE_MESSAGE: &str = "I'm **Orito**, a Linux-specialized assistant. I can only help with Linux, system administration, command-line tools, and open-source software. Some things I can help with: system setup, troubleshooting, security, networking, DevOps, and shell scripting.";

/// Everything the orchestrator needs from its host to run a turn.
pub struct OrchestratorDeps {
    pub completer: Arc<dyn Completer>,
    pub store: Arc<dyn Store>,
    pub tool_registry: Arc<ToolRegistry>,
    pub definitions: Arc<AgentDefinitionLoader>,
    pub model_selector: Arc<ModelSelector>,
}

/// Per-session mutable state the orchestrator owns exclusively (spec.md §5
/// shared-resource policy).
#[derive(Default)]
struct SessionState {
    active_agents: HashMap<String, u8>,
    pending_questions: HashMap<String, oneshot::Sender<String>>,
    pending_query: Option<String>,
    preferences_loaded: bool,
    preferences: Option<UserPreferences>,
}

/// Orchestrates one chat session's turns.
pub struct Orchestrator {
    chat_id: String,
    session_id: String,
    user_id: Option<String>,
    config: OrchestratorConfig,
    deps: OrchestratorDeps,
    event_bus: Arc<EventBus>,
    state: RwLock<SessionState>,
    agent_counter: AtomicU32,
}

impl Orchestrator {
    pub fn new(
        chat_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: Option<String>,
        config: OrchestratorConfig,
        deps: OrchestratorDeps,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            session_id: session_id.into(),
            user_id,
            config,
            deps,
            event_bus,
            state: RwLock::new(SessionState::default()),
            agent_counter: AtomicU32::new(0),
        }
    }

    /// Debug/introspection accessor: number of agents currently live across
    /// all tiers.
    pub async fn active_agent_count(&self) -> usize {
        self.state.read().await.active_agents.len()
    }

    /// Subscribe a new consumer to this session's event stream (the
    /// transport layer, or an additional audit sink).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_bus.subscribe()
    }

    fn next_agent_id(&self) -> String {
        let n = self.agent_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-agent-{n}", self.session_id)
    }

    /// `resolveUserAnswer`: completes the pending question's channel with
    /// the user's answer, removing the map entry (spec.md §4.8).
    pub async fn resolve_user_answer(&self, question_id: &str, answer: String) {
        let sender = self.state.write().await.pending_questions.remove(question_id);
        if let Some(sender) = sender {
            let _ = sender.send(answer);
        }
    }

    /// `updateSystemProfile`: persists the profile and, if a deferred query
    /// was queued, re-invokes `process` with it (spec.md §6.5).
    pub async fn update_system_profile(
        &self,
        new_profile: SystemProfileData,
    ) -> Result<Option<ProcessOutcome>, OrchestratorError> {
        let legacy = profile::to_legacy(&new_profile);
        self.persist_profile(&new_profile, &legacy).await?;

        let pending = self.state.write().await.pending_query.take();
        match pending {
            Some(query) => Ok(Some(self.process(&query).await?)),
            None => Ok(None),
        }
    }

    async fn persist_profile(
        &self,
        profile: &SystemProfileData,
        legacy: &LegacySystemProfile,
    ) -> Result<(), OrchestratorError> {
        self.deps
            .store
            .update_chat_system_profile(&self.chat_id, profile, legacy)
            .await
            .map_err(|e| OrchestratorError::Other(e.to_string()))
    }

    async fn load_preferences(&self) {
        let already_loaded = self.state.read().await.preferences_loaded;
        if already_loaded {
            return;
        }
        let preferences = match &self.user_id {
            Some(user_id) => self.deps.store.find_preferences_by_user_id(user_id).await.ok().flatten(),
            None => None,
        };
        let mut state = self.state.write().await;
        state.preferences = preferences;
        state.preferences_loaded = true;
    }

    async fn audit(&self, command: &str, risk: &str, details: serde_json::Value) {
        let entry = AuditLogEntry {
            chat_id: self.chat_id.clone(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            action_id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            risk: risk.to_string(),
            user_decision: None,
            hmac: String::new(),
            created_at: Utc::now(),
            details,
        };
        // Audit logging failures never cascade (spec.md §7 propagation policy).
        if let Err(e) = self.deps.store.append_audit_log(entry).await {
            self.event_bus.emit(Event::error(format!("audit log append failed: {e}"))).await;
        }
    }

    async fn current_profile(&self) -> Result<Option<SystemProfileData>, OrchestratorError> {
        let chat = self
            .deps
            .store
            .find_chat_by_id(&self.chat_id)
            .await
            .map_err(|e| OrchestratorError::Other(e.to_string()))?;
        Ok(chat.and_then(|c| c.context.system_profile))
    }

    fn needs_system_profile(intent: Intent) -> bool {
        matches!(intent, Intent::Action | Intent::Repair)
    }

    /// Checks per-tier concurrency (spec.md §5 `TIER_LIMITS`), tracks
    /// `agent_id` against its tier if there's room, and returns whether the
    /// spawn is permitted. `agent_id` must be the same id the caller then
    /// constructs the `AgentHandle` with, so `release_agent_slot` can find
    /// the entry again.
    async fn try_reserve_agent_slot(&self, agent_id: &str, tier: &str) -> bool {
        let limit = self.config.max_concurrent_for_tier(tier);
        let mut state = self.state.write().await;
        let live_in_tier = state.active_agents.values().filter(|t| **t as usize == tier_rank(tier)).count() as u32;
        if live_in_tier >= limit {
            return false;
        }
        state.active_agents.insert(agent_id.to_string(), tier_rank(tier) as u8);
        true
    }

    async fn release_agent_slot(&self, agent_id: &str) {
        self.state.write().await.active_agents.remove(agent_id);
    }

    fn new_agent_handle(&self, id: String, agent_type: &str, depth: u8) -> Result<AgentHandle, OrchestratorError> {
        let definition = self.deps.definitions.load(agent_type)?;
        Ok(AgentHandle::new(
            id,
            agent_type,
            definition,
            depth,
            self.event_bus.clone(),
            self.config.agent_defaults,
        ))
    }

    /// Fails fast with `CircuitBreakerOpen` if `handle`'s breaker is open,
    /// otherwise runs `f` through `execute_with_retry` (spec.md §4.4 retry
    /// policy, §7 `CircuitBreakerOpen`).
    async fn run_guarded<T, F, Fut>(
        &self,
        handle: &AgentHandle,
        label: &str,
        f: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
    {
        if !handle.can_execute() {
            return Err(OrchestratorError::CircuitBreakerOpen(handle.id.clone()));
        }
        handle.execute_with_retry(f, label).await
    }

    /// `process(userMessage)`: the single entry point for a turn (spec.md
    /// §4.8).
    pub async fn process(&self, user_message: &str) -> Result<ProcessOutcome, OrchestratorError> {
        let started_at = Utc::now();
        self.load_preferences().await;
        self.audit("process_started", "none", serde_json::json!({ "message": user_message })).await;

        let classification = classifier::classify(user_message);
        log::debug!(
            "classified \"{user_message}\" as {:?}/{:?}",
            classification.intent,
            classification.complexity
        );

        let outcome = if classification.complexity == Complexity::Decline {
            self.handle_decline().await
        } else if classification.intent == Intent::SystemDiscovery {
            self.handle_system_discovery().await
        } else if Self::needs_system_profile(classification.intent) {
            match self.current_profile().await? {
                Some(profile) if profile::is_complete(&profile) => {
                    self.handle_profile_confirmation(user_message, profile, classification).await
                }
                _ => self.handle_profile_gate(user_message).await,
            }
        } else {
            self.run_pipeline(user_message, classification).await
        }?;

        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        self.audit(
            "process_completed",
            "none",
            serde_json::json!({
                "durationMs": duration_ms,
                "intent": format!("{:?}", classification.intent),
                "complexity": format!("{:?}", classification.complexity),
                "agentsSpawned": outcome.agent_metrics.len(),
            }),
        )
        .await;

        Ok(outcome)
    }

    async fn run_pipeline(
        &self,
        user_message: &str,
        classification: classifier::Classification,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        match classification.complexity {
            Complexity::Simple => self.handle_simple_query(user_message, Vec::new()).await,
            Complexity::Moderate => self.handle_moderate_query(user_message, classification.intent).await,
            Complexity::Complex => self.handle_complex_query(user_message, classification.intent).await,
            Complexity::Decline => unreachable!(),
        }
    }

    /// `ensureProfile(chat, askOne)`: a complete profile already on file
    /// still gets a single confirmation question before the action/repair
    /// pipeline runs, since the system may have changed since it was
    /// collected (spec.md §4.7). Declining falls through to full collection.
    async fn handle_profile_confirmation(
        &self,
        user_message: &str,
        profile: SystemProfileData,
        classification: classifier::Classification,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let confirm_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&confirm_id, "simple").await {
            self.event_bus
                .emit(Event::error("agent limit reached while confirming the system profile".to_string()))
                .await;
            return self.run_pipeline(user_message, classification).await;
        }

        let handle = self.new_agent_handle(confirm_id, "curious", 0)?;
        self.spawn_event(&handle, "curious", user_message, None, 0).await;

        if !handle.can_execute() {
            self.release_agent_slot(&handle.id).await;
            self.event_bus.emit(Event::error(format!("curious agent {} circuit open", handle.id))).await;
            return self.run_pipeline(user_message, classification).await;
        }

        let question = PendingQuestion {
            question: format!(
                "Still on {} with {}? Reply \"yes\" to continue, or \"no\" to update your system details.",
                profile.distro, profile.package_manager
            ),
            header: None,
            purpose: None,
            options: vec![
                crate::event::QuestionOption { label: "Yes".to_string(), description: None },
                crate::event::QuestionOption { label: "No".to_string(), description: None },
            ],
            multiple: false,
            allow_custom: true,
        };

        let result = {
            let mut to_register = Vec::new();
            let answers_result =
                handle.ask_user_questions(vec![question], |id, tx| to_register.push((id, tx))).await;
            for (id, tx) in to_register {
                self.state.write().await.pending_questions.insert(id, tx);
            }
            answers_result
        };

        match &result {
            Ok(_) => handle.record_success(),
            Err(_) => handle.record_failure(),
        }
        self.release_agent_slot(&handle.id).await;

        match result {
            Ok(answers) => {
                let confirmed = answers.first().map(|a| a.eq_ignore_ascii_case("yes")).unwrap_or(false);
                handle.emit(EventKind::AgentResult {
                    agent_id: handle.id.clone(),
                    summary: if confirmed { "profile confirmed".to_string() } else { "profile needs updating".to_string() },
                }).await;
                if confirmed {
                    self.run_pipeline(user_message, classification).await
                } else {
                    self.handle_profile_gate(user_message).await
                }
            }
            Err(e) => {
                self.event_bus.emit(Event::error(format!("profile confirmation failed: {e}"))).await;
                self.handle_simple_query(user_message, Vec::new()).await
            }
        }
    }

    async fn handle_decline(&self) -> Result<ProcessOutcome, OrchestratorError> {
        self.event_bus.emit(Event::message_chunk(DECLINE_MESSAGE)).await;
        self.emit_done(vec![], vec![], None, vec![]).await;
        Ok(ProcessOutcome::empty())
    }

    async fn handle_system_discovery(&self) -> Result<ProcessOutcome, OrchestratorError> {
        self.event_bus.emit(Event::message_chunk("Got it, thanks for the system details.")).await;
        self.emit_done(vec![], vec![], None, vec![]).await;
        Ok(ProcessOutcome::empty())
    }

    async fn handle_profile_gate(&self, user_message: &str) -> Result<ProcessOutcome, OrchestratorError> {
        self.state.write().await.pending_query = Some(user_message.to_string());

        let curious_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&curious_id, "simple").await {
            self.event_bus
                .emit(Event::error("agent limit reached while spawning the profile collector".to_string()))
                .await;
            self.state.write().await.pending_query = None;
            return self.handle_simple_query(user_message, Vec::new()).await;
        }

        let handle = self.new_agent_handle(curious_id, "curious", 0)?;
        handle.set_state(crate::agent::AgentState::Thinking).await;
        handle
            .emit(EventKind::AgentSpawn {
                agent_id: handle.id.clone(),
                name: "System Profile Collector".to_string(),
                agent_type: "curious".to_string(),
                color: handle.definition.color.clone(),
                task: user_message.to_string(),
                parent_agent_id: None,
                depth: 0,
            })
            .await;

        if curious::should_spawn_research(user_message) {
            handle
                .emit(EventKind::AgentStatus {
                    agent_id: handle.id.clone(),
                    status: "gathering background context while waiting on system details".to_string(),
                })
                .await;
        }

        let fields = profile::question_set();
        let field_names: Vec<&str> = fields.iter().map(|q| q.field).collect();

        let discovery = curious::run_command_mode(&field_names);
        handle
            .emit(EventKind::SystemDiscovery {
                agent_id: handle.id.clone(),
                commands: discovery.commands,
                prompt: discovery.prompt,
            })
            .await;

        let question_mode = curious::run_question_mode();
        let questions = fields
            .iter()
            .map(|q| PendingQuestion {
                question: q.question.clone(),
                header: None,
                purpose: Some(question_mode.prompt.clone()),
                options: q
                    .options
                    .iter()
                    .map(|o| crate::event::QuestionOption { label: o.label.clone(), description: None })
                    .collect(),
                multiple: false,
                allow_custom: true,
            })
            .collect();

        if !handle.can_execute() {
            self.release_agent_slot(&handle.id).await;
            self.state.write().await.pending_query = None;
            self.event_bus.emit(Event::error(format!("curious agent {} circuit open", handle.id))).await;
            return self.handle_simple_query(user_message, Vec::new()).await;
        }

        let result = {
            let mut to_register = Vec::new();
            let answers_result = handle
                .ask_user_questions(questions, |id, tx| to_register.push((id, tx)))
                .await;
            for (id, tx) in to_register {
                self.state.write().await.pending_questions.insert(id, tx);
            }
            answers_result
        };

        match &result {
            Ok(_) => handle.record_success(),
            Err(_) => handle.record_failure(),
        }

        self.release_agent_slot(&handle.id).await;

        match result {
            Ok(_answers) => {
                // The caller's transport layer is expected to route the
                // actual five answers back through `update_system_profile`,
                // which clears `pending_query` and re-invokes `process`; a
                // successful spawn alone emits no further events here.
                handle.emit(EventKind::AgentResult {
                    agent_id: handle.id.clone(),
                    summary: "awaiting profile answers".to_string(),
                }).await;
                Ok(ProcessOutcome::empty())
            }
            Err(e) => {
                self.state.write().await.pending_query = None;
                self.event_bus.emit(Event::error(format!("profile collection failed: {e}"))).await;
                self.handle_simple_query(user_message, Vec::new()).await
            }
        }
    }

    /// `handleSimpleQuery`: a single non-streaming completion with model
    /// fallback on failure (spec.md §4.8).
    async fn handle_simple_query(
        &self,
        user_message: &str,
        mut attempted_models: Vec<String>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let selection = self.select_model(false, false, false, Complexity::Simple, None);
        let model = selection
            .fallback_chain
            .iter()
            .find(|m| !attempted_models.contains(m))
            .cloned()
            .unwrap_or(selection.selected_model.clone());

        let system_prompt = self.render_simple_system_prompt().await;
        let messages = vec![Message::system(system_prompt), Message::user(user_message.to_string())];

        let opts = CompletionOptions { model_id: model.clone(), ..Default::default() };
        match self.deps.completer.complete(&messages, &opts).await {
            Ok(result) => {
                self.event_bus.emit(Event::message_chunk(result.content.clone())).await;
                let tokens = result.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
                self.emit_done(vec![], vec![], Some(tokens), vec![]).await;
                Ok(ProcessOutcome { response: result.content, citations: vec![], commands: vec![], agent_metrics: vec![] })
            }
            Err(e) => {
                attempted_models.push(model);
                if let Some(_next) = ModelSelector::get_next_fallback(&selection.fallback_chain, &attempted_models) {
                    Box::pin(self.handle_simple_query(user_message, attempted_models)).await
                } else {
                    let message = format!("I couldn't get a response right now: {e}");
                    self.event_bus.emit(Event::message_chunk(message.clone())).await;
                    self.emit_done(vec![], vec![], None, vec![]).await;
                    Ok(ProcessOutcome { response: message, citations: vec![], commands: vec![], agent_metrics: vec![] })
                }
            }
        }
    }

    async fn handle_moderate_query(
        &self,
        user_message: &str,
        intent: Intent,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let research_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&research_id, "moderate").await {
            self.event_bus.emit(Event::error("agent limit reached for moderate tier".to_string())).await;
            return self.handle_simple_query(user_message, Vec::new()).await;
        }

        let research_handle = self.new_agent_handle(research_id, "research", 0)?;
        let strategy = classifier::determine_research_strategy(user_message, intent);
        let model = self.select_model(true, false, false, Complexity::Moderate, None).selected_model;

        self.spawn_event(&research_handle, "research", user_message, None, 0).await;
        let research_result = self
            .run_guarded(&research_handle, "research", || {
                research::run_research(
                    &research_handle,
                    self.deps.completer.as_ref(),
                    &self.deps.tool_registry,
                    user_message,
                    strategy,
                    &model,
                )
            })
            .await;
        self.release_agent_slot(&research_handle.id).await;

        let research_result = match research_result {
            Ok(r) => r,
            Err(e) => {
                self.event_bus.emit(Event::error(format!("research agent failed: {e}"))).await;
                return self.handle_simple_query(user_message, Vec::new()).await;
            }
        };
        research_handle.emit(EventKind::AgentResult {
            agent_id: research_handle.id.clone(),
            summary: research_result.summary.clone(),
        }).await;

        let synth_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&synth_id, "moderate").await {
            self.event_bus.emit(Event::error("agent limit reached for synthesizer".to_string())).await;
            return self.handle_simple_query(user_message, Vec::new()).await;
        }
        let synth_handle = self.new_agent_handle(synth_id, "synthesizer", 0)?;
        self.spawn_event(&synth_handle, "synthesizer", user_message, None, 0).await;

        let input = SynthesisInput { research_summary: research_result.summary.clone(), ..Default::default() };
        let messages = vec![
            Message::system(synth_handle.definition.prompt_template.clone()),
            Message::user(user_message.to_string()),
        ];
        let opts = CompletionOptions { model_id: model.clone(), ..Default::default() };
        let synth_result = self
            .run_guarded(&synth_handle, "synthesizer", || {
                synthesizer::run_synthesizer(
                    &synth_handle,
                    self.deps.completer.as_ref(),
                    messages.clone(),
                    &opts,
                    &input,
                    "moderate",
                )
            })
            .await;
        self.release_agent_slot(&synth_handle.id).await;

        let synth_result = synth_result?;
        synth_handle.emit(EventKind::AgentResult {
            agent_id: synth_handle.id.clone(),
            summary: "response ready".to_string(),
        }).await;

        let total_tokens = research_result.tokens_used + synth_result.tokens_used;
        let metrics = vec![
            AgentMetricSummary { agent_id: research_handle.id.clone(), agent_type: "research".to_string(), tokens_used: research_result.tokens_used },
            AgentMetricSummary { agent_id: synth_handle.id.clone(), agent_type: "synthesizer".to_string(), tokens_used: synth_result.tokens_used },
        ];
        self.emit_done(vec![], vec![], Some(total_tokens), metrics.clone()).await;

        Ok(ProcessOutcome {
            response: synth_result.response,
            citations: research_result.citations.into_iter().map(|c| serde_json::to_value(c).unwrap()).collect(),
            commands: vec![],
            agent_metrics: metrics,
        })
    }

    async fn handle_complex_query(
        &self,
        user_message: &str,
        intent: Intent,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let research_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&research_id, "complex").await {
            self.event_bus.emit(Event::error("agent limit reached for complex tier".to_string())).await;
            return self.handle_simple_query(user_message, Vec::new()).await;
        }

        let research_handle = self.new_agent_handle(research_id, "research", 0)?;
        let strategy = classifier::determine_research_strategy(user_message, intent);
        let model = self.select_model(true, true, false, Complexity::Complex, None).selected_model;

        self.spawn_event(&research_handle, "research", user_message, None, 0).await;
        let research_result = self
            .run_guarded(&research_handle, "research", || {
                research::run_research(
                    &research_handle,
                    self.deps.completer.as_ref(),
                    &self.deps.tool_registry,
                    user_message,
                    strategy,
                    &model,
                )
            })
            .await;
        self.release_agent_slot(&research_handle.id).await;
        let research_result = research_result.map_err(|e| OrchestratorError::Other(e.to_string()))?;

        let mut metrics = vec![AgentMetricSummary {
            agent_id: research_handle.id.clone(),
            agent_type: "research".to_string(),
            tokens_used: research_result.tokens_used,
        }];

        let planner_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&planner_id, "complex").await {
            return self.fallback_from_research(&research_result.summary, metrics).await;
        }
        let planner_handle = self.new_agent_handle(planner_id, "planner", 0)?;
        self.spawn_event(&planner_handle, "planner", user_message, None, 0).await;
        let planner_result = self
            .run_guarded(&planner_handle, "planner", || {
                planner::run_planner(
                    &planner_handle,
                    self.deps.completer.as_ref(),
                    &self.deps.tool_registry,
                    user_message,
                    &research_result.summary,
                    &model,
                )
            })
            .await;
        self.release_agent_slot(&planner_handle.id).await;

        let planner_output = match planner_result {
            Ok(r) => {
                metrics.push(AgentMetricSummary {
                    agent_id: planner_handle.id.clone(),
                    agent_type: "planner".to_string(),
                    tokens_used: r.tokens_used,
                });
                r.output
            }
            Err(e) => {
                self.event_bus.emit(Event::error(format!("planner agent failed: {e}"))).await;
                return self.fallback_from_research(&research_result.summary, metrics).await;
            }
        };

        let (validated_commands, blocked, warnings, suggestions) = if !planner_output.commands.is_empty() {
            let detected_pm = self
                .current_profile()
                .await?
                .map(|p| p.package_manager)
                .unwrap_or_else(|| "apt".to_string());

            let validator_id = self.next_agent_id();
            if self.try_reserve_agent_slot(&validator_id, "complex").await {
                let validator_handle = self.new_agent_handle(validator_id, "validator", 0)?;
                self.spawn_event(&validator_handle, "validator", user_message, None, 0).await;

                let validator_outcome = if validator_handle.can_execute() {
                    let outcome = validator::run_validator(
                        &self.deps.tool_registry,
                        planner_output.commands.clone(),
                        &detected_pm,
                    )
                    .await;
                    validator_handle.record_success();
                    outcome
                } else {
                    self.event_bus
                        .emit(Event::error(format!("validator {} circuit open", validator_handle.id)))
                        .await;
                    validator::ValidatorResult {
                        validated_commands: planner_output.commands.clone(),
                        ..Default::default()
                    }
                };

                validator_handle
                    .emit(EventKind::AgentResult {
                        agent_id: validator_handle.id.clone(),
                        summary: format!(
                            "{} validated, {} blocked",
                            validator_outcome.validated_commands.len(),
                            validator_outcome.blocked.len()
                        ),
                    })
                    .await;
                self.release_agent_slot(&validator_handle.id).await;

                (
                    validator_outcome.validated_commands,
                    validator_outcome.blocked,
                    validator_outcome.warnings,
                    validator_outcome.suggestions,
                )
            } else {
                (planner_output.commands.clone(), vec![], vec![], vec![])
            }
        } else {
            (vec![], vec![], vec![], vec![])
        };

        let synth_id = self.next_agent_id();
        if !self.try_reserve_agent_slot(&synth_id, "complex").await {
            self.event_bus.emit(Event::error("agent limit reached for synthesizer".to_string())).await;
            return self.handle_simple_query(user_message, Vec::new()).await;
        }
        let synth_handle = self.new_agent_handle(synth_id, "synthesizer", 0)?;
        self.spawn_event(&synth_handle, "synthesizer", user_message, None, 0).await;

        let input = SynthesisInput {
            research_summary: research_result.summary.clone(),
            steps: planner_output.steps.clone(),
            commands: validated_commands.clone(),
            citations: research_result.citations.iter().map(|c| c.title.clone()).collect(),
            warnings,
            blocked: blocked.clone(),
            suggestions,
            prerequisites: planner_output.prerequisites.clone(),
            troubleshooting: planner_output.troubleshooting.clone(),
        };
        let messages = vec![
            Message::system(synth_handle.definition.prompt_template.clone()),
            Message::user(user_message.to_string()),
        ];
        let opts = CompletionOptions { model_id: model.clone(), ..Default::default() };
        let synth_result = self
            .run_guarded(&synth_handle, "synthesizer", || {
                synthesizer::run_synthesizer(
                    &synth_handle,
                    self.deps.completer.as_ref(),
                    messages.clone(),
                    &opts,
                    &input,
                    "complex",
                )
            })
            .await?;
        self.release_agent_slot(&synth_handle.id).await;

        metrics.push(AgentMetricSummary {
            agent_id: synth_handle.id.clone(),
            agent_type: "synthesizer".to_string(),
            tokens_used: synth_result.tokens_used,
        });

        let total_tokens = metrics.iter().map(|m| m.tokens_used).sum();
        let commands_json: Vec<serde_json::Value> =
            validated_commands.iter().map(|c| serde_json::to_value(c).unwrap()).collect();
        let citations_json: Vec<serde_json::Value> =
            research_result.citations.iter().map(|c| serde_json::to_value(c).unwrap()).collect();

        self.emit_done(citations_json.clone(), commands_json.clone(), Some(total_tokens), metrics.clone()).await;

        Ok(ProcessOutcome {
            response: synth_result.response,
            citations: citations_json,
            commands: commands_json,
            agent_metrics: metrics,
        })
    }

    async fn fallback_from_research(
        &self,
        research_summary: &str,
        metrics: Vec<AgentMetricSummary>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        self.event_bus.emit(Event::message_chunk(research_summary.to_string())).await;
        let total_tokens = metrics.iter().map(|m| m.tokens_used).sum();
        self.emit_done(vec![], vec![], Some(total_tokens), metrics.clone()).await;
        Ok(ProcessOutcome {
            response: research_summary.to_string(),
            citations: vec![],
            commands: vec![],
            agent_metrics: metrics,
        })
    }

    async fn spawn_event(
        &self,
        handle: &AgentHandle,
        name: &str,
        task: &str,
        parent_agent_id: Option<String>,
        depth: u8,
    ) {
        handle
            .emit(EventKind::AgentSpawn {
                agent_id: handle.id.clone(),
                name: name.to_string(),
                agent_type: handle.agent_type.clone(),
                color: handle.definition.color.clone(),
                task: task.to_string(),
                parent_agent_id,
                depth,
            })
            .await;
    }

    async fn emit_done(
        &self,
        citations: Vec<serde_json::Value>,
        commands: Vec<serde_json::Value>,
        total_tokens_used: Option<u32>,
        agent_metrics: Vec<AgentMetricSummary>,
    ) {
        self.event_bus
            .emit(Event::new(EventKind::MessageDone {
                citations,
                commands,
                total_tokens_used,
                agent_metrics: if agent_metrics.is_empty() { None } else { Some(agent_metrics) },
            }))
            .await;
    }

    async fn render_simple_system_prompt(&self) -> String {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let preferences = self
            .state
            .read()
            .await
            .preferences
            .as_ref()
            .map(|p| p.system_configuration())
            .unwrap_or_default();
        format!("You are Orito, a Linux-specialized assistant. Today's date is {date}.\n{preferences}")
    }

    fn select_model(
        &self,
        requires_tools: bool,
        requires_deep_reasoning: bool,
        requires_coding: bool,
        complexity: Complexity,
        preferred_model: Option<String>,
    ) -> ModelSelection {
        let ctx = TaskContext {
            query: String::new(),
            requires_tools,
            tool_count: if requires_tools { 1 } else { 0 },
            requires_coding,
            requires_deep_reasoning,
            requires_long_context: false,
            estimated_context_size: 0,
            urgency: crate::model_selector::Urgency::Balanced,
            complexity: match complexity {
                Complexity::Simple => crate::model_selector::Complexity::Simple,
                Complexity::Moderate => crate::model_selector::Complexity::Moderate,
                Complexity::Complex | Complexity::Decline => crate::model_selector::Complexity::Complex,
            },
            preferred_model,
        };
        self.deps.model_selector.select(&ctx)
    }
}

fn tier_rank(tier: &str) -> usize {
    match tier {
        "simple" => 0,
        "moderate" => 1,
        "complex" => 2,
        _ => 3,
    }
}

/// Result of a completed `process` turn.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub response: String,
    pub citations: Vec<serde_json::Value>,
    pub commands: Vec<serde_json::Value>,
    pub agent_metrics: Vec<AgentMetricSummary>,
}

impl ProcessOutcome {
    fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_definition::AgentDefinitionLoader;
    use crate::client_wrapper::{CompletionResult, TokenUsage};
    use crate::model_selector::ModelCatalog;
    use crate::store::Chat;
    use async_trait::async_trait;

    struct EchoCompleter;

    #[async_trait]
    impl Completer for EchoCompleter {
        async fn complete(
            &self,
            messages: &[Message],
            _opts: &CompletionOptions,
        ) -> Result<CompletionResult, crate::errors::BoxError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResult {
                content: format!("Answer about: {last}"),
                tool_calls: vec![],
                model_used: "fast-agent".to_string(),
                usage: Some(TokenUsage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 }),
            })
        }
    }

    struct InMemoryStore;

    #[async_trait]
    impl Store for InMemoryStore {
        async fn find_chat_by_id(&self, chat_id: &str) -> Result<Option<Chat>, crate::errors::BoxError> {
            Ok(Some(Chat { id: chat_id.to_string(), context: Default::default(), system_profile: None }))
        }

        async fn update_chat_system_profile(
            &self,
            _chat_id: &str,
            _profile: &SystemProfileData,
            _legacy: &LegacySystemProfile,
        ) -> Result<(), crate::errors::BoxError> {
            Ok(())
        }

        async fn append_audit_log(&self, _entry: AuditLogEntry) -> Result<(), crate::errors::BoxError> {
            Ok(())
        }

        async fn find_preferences_by_user_id(
            &self,
            _user_id: &str,
        ) -> Result<Option<UserPreferences>, crate::errors::BoxError> {
            Ok(None)
        }
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

    fn orchestrator() -> Orchestrator {
        let deps = OrchestratorDeps {
            completer: Arc::new(EchoCompleter),
            store: Arc::new(InMemoryStore),
            tool_registry: Arc::new(ToolRegistry::new()),
            definitions: Arc::new(AgentDefinitionLoader::new()),
            model_selector: Arc::new(ModelSelector::new(catalog())),
        };
        Orchestrator::new("chat-1", "session-1", None, OrchestratorConfig::default(), deps, Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn s1_greeting_emits_chunk_and_done_with_no_agents() {
        let orch = orchestrator();
        let mut rx = orch.event_bus.subscribe();

        let outcome = orch.process("hi").await.unwrap();
        assert!(outcome.citations.is_empty());
        assert!(outcome.commands.is_empty());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::MessageChunk { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, EventKind::MessageDone { .. }));
    }

    #[tokio::test]
    async fn s2_decline_contains_orito_literal_and_spawns_no_agents() {
        let orch = orchestrator();
        let mut rx = orch.event_bus.subscribe();

        let outcome = orch.process("write me a poem about cats").await.unwrap();
        assert!(outcome.citations.is_empty());
        assert!(outcome.commands.is_empty());

        let first = rx.recv().await.unwrap();
        match first.kind {
            EventKind::MessageChunk { content } => assert!(content.contains("Orito")),
            other => panic!("expected MessageChunk, got {other:?}"),
        }
        assert_eq!(orch.active_agent_count().await, 0);
    }

    #[tokio::test]
    async fn reserved_agent_slot_is_freed_by_release_under_the_same_id() {
        let orch = orchestrator();
        let tier = "complex";
        let limit = orch.config.max_concurrent_for_tier(tier) as usize;

        // Reserve-then-release, `limit` times over, must never exhaust the
        // tier: the id passed to release has to be the same one the
        // reservation was keyed under, or slots leak across calls.
        for _ in 0..limit * 3 {
            let id = orch.next_agent_id();
            assert!(orch.try_reserve_agent_slot(&id, tier).await, "slot should still be available");
            orch.release_agent_slot(&id).await;
        }

        assert_eq!(orch.state.read().await.active_agents.len(), 0);
    }
}
