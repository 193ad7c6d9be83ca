//! Streaming event bus (spec.md §4.9, wire contract in §6.4).
//!
//! Each agent emits a FIFO stream of [`Event`]s; the orchestrator fans every
//! agent's stream into a single per-session channel in the order received.
//! Event ordering within one agent is guaranteed; ordering across agents is
//! only guaranteed where spec.md calls out a causal relation (a sub-agent's
//! `AgentSpawn` follows its parent's `request:spawn`).
//!
//! # Example
//!
//! ```rust
//! use orito_core::event::{Event, EventBus};
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//! bus.emit(Event::message_chunk("hello")).await;
//! let received = rx.recv().await.unwrap();
//! assert!(matches!(received, Event { kind: orito_core::event::EventKind::MessageChunk { .. }, .. }));
//! # });
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A single question option offered to the user (spec.md §4.4 `askUserQuestions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    pub description: Option<String>,
}

/// Tagged union of wire events, per spec.md §6.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "agent:spawn")]
    AgentSpawn {
        agent_id: String,
        name: String,
        agent_type: String,
        color: String,
        task: String,
        parent_agent_id: Option<String>,
        depth: u8,
    },
    #[serde(rename = "agent:status")]
    AgentStatus { agent_id: String, status: String },
    #[serde(rename = "agent:tool")]
    AgentTool {
        agent_id: String,
        tool: String,
        input: Value,
        status: String,
        output: Option<Value>,
        tokens_used: Option<u32>,
        duration_ms: Option<u64>,
    },
    #[serde(rename = "agent:question")]
    AgentQuestion {
        agent_id: String,
        question_id: String,
        question: String,
        header: Option<String>,
        purpose: Option<String>,
        options: Vec<QuestionOption>,
        multiple: bool,
        allow_custom: bool,
    },
    #[serde(rename = "agent:result")]
    AgentResult { agent_id: String, summary: String },
    #[serde(rename = "system:discovery")]
    SystemDiscovery { agent_id: String, commands: Vec<String>, prompt: String },
    #[serde(rename = "message:chunk")]
    MessageChunk { content: String },
    #[serde(rename = "message:done")]
    MessageDone {
        citations: Vec<Value>,
        commands: Vec<Value>,
        total_tokens_used: Option<u32>,
        agent_metrics: Option<Vec<AgentMetricSummary>>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Per-agent token summary attached to the terminal `message:done` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetricSummary {
    pub agent_id: String,
    pub agent_type: String,
    pub tokens_used: u32,
}

/// A wire event with its emission timestamp (ISO-8601, per spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self { timestamp: Utc::now(), kind }
    }

    pub fn message_chunk(content: impl Into<String>) -> Self {
        Self::new(EventKind::MessageChunk { content: content.into() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error { message: message.into() })
    }
}

/// Fan-in/fan-out channel from agents to the session consumer.
///
/// Wraps a [`tokio::sync::broadcast`] channel so the orchestrator can forward
/// every agent's events to the session in receive order while still allowing
/// tests (and multiple consumers, e.g. an audit sink) to subscribe
/// independently. Capacity is generous (1024) since the orchestrator is
/// expected to drain promptly; a slow consumer only loses the oldest
/// buffered events, it never blocks emitters.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(1024);
        Self { sender }
    }

    /// Subscribe a new consumer. Each subscriber receives every event
    /// emitted from this point forward, in emission order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers. A send with no subscribers
    /// is not an error (the session may not have attached yet).
    pub async fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
