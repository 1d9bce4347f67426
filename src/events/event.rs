//! Event types for EventLoom
//!
//! This module defines the immutable event record that every agent, tool and
//! UI client observes, plus the sealed payload union that replaces the
//! duck-typed "kind tag + dict" shape of older event logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The origin of an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// A human user (message, confirmation, interrupt)
    User,
    /// The agent loop itself (actions, conclusions)
    Agent,
    /// The surrounding environment (tool output, state changes)
    Environment,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::User => write!(f, "user"),
            EventSource::Agent => write!(f, "agent"),
            EventSource::Environment => write!(f, "environment"),
        }
    }
}

/// Security-risk annotation attached by an external analyzer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecurityRisk {
    Low,
    Medium,
    High,
}

/// The kind-specific body of an event.
///
/// Serialized with an internal `kind` tag so that every persisted record is
/// self-describing:
///
/// ```
/// use eventloom::events::EventPayload;
///
/// let payload = EventPayload::Message { content: "hi".into() };
/// let json = serde_json::to_string(&payload).unwrap();
/// assert!(json.contains(r#""kind":"message""#));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// A chat message (user prompt or agent conclusion, depending on source)
    Message { content: String },
    /// Agent chain-of-thought that never reaches the user
    Think { thought: String },
    /// The agent declares the task finished
    Finish { outputs: String },
    /// Shell command invocation
    CommandRun { command: String },
    /// Shell command output
    CommandOutput { output: String },
    /// File read action
    FileRead { path: String },
    /// File write action
    FileWrite { path: String, content: String },
    /// File edit action
    FileEdit { path: String, diff: String },
    /// Result of a file read
    FileReadObservation { path: String, content: String },
    /// Result of a file edit/write - kept by the task-completion condenser
    FileEditObservation { path: String, content: String },
    /// Browser navigation action
    BrowserNavigate { url: String },
    /// Browser output (accessibility tree, screenshot description)
    BrowserOutput { content: String },
    /// MCP tool invocation
    McpCall { tool: String, arguments: String },
    /// MCP tool result
    McpObservation { content: String },
    /// Delegation of a task to another agent
    TaskDelegate { agent: String, task: String },
    /// Result reported back by a delegated agent
    DelegateObservation { content: String },
    /// Agent state transition (running, finished, error, ...)
    StateChange { state: String },
    /// A condensation marker persisted into the log: `forgotten_first..=forgotten_last`
    /// were replaced by `summary`
    Condensation {
        summary: String,
        forgotten_first: i64,
        forgotten_last: i64,
    },
}

impl EventPayload {
    /// The `kind` tag this payload serializes under.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Message { .. } => "message",
            EventPayload::Think { .. } => "think",
            EventPayload::Finish { .. } => "finish",
            EventPayload::CommandRun { .. } => "command_run",
            EventPayload::CommandOutput { .. } => "command_output",
            EventPayload::FileRead { .. } => "file_read",
            EventPayload::FileWrite { .. } => "file_write",
            EventPayload::FileEdit { .. } => "file_edit",
            EventPayload::FileReadObservation { .. } => "file_read_observation",
            EventPayload::FileEditObservation { .. } => "file_edit_observation",
            EventPayload::BrowserNavigate { .. } => "browser_navigate",
            EventPayload::BrowserOutput { .. } => "browser_output",
            EventPayload::McpCall { .. } => "mcp_call",
            EventPayload::McpObservation { .. } => "mcp_observation",
            EventPayload::TaskDelegate { .. } => "task_delegate",
            EventPayload::DelegateObservation { .. } => "delegate_observation",
            EventPayload::StateChange { .. } => "state_change",
            EventPayload::Condensation { .. } => "condensation",
        }
    }
}

/// An immutable, uniquely-identified record of something that happened in a
/// conversation.
///
/// A freshly constructed event carries the [`Event::INVALID_ID`] sentinel;
/// the id, timestamp and source are stamped by the stream when the event is
/// added. Once persisted the id never changes and is strictly increasing
/// within its conversation.
///
/// # Example
/// ```
/// use eventloom::events::{Event, EventSource};
///
/// let event = Event::message("run the tests");
/// assert_eq!(event.id, Event::INVALID_ID);
/// assert!(event.source.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Assigned by the stream; `INVALID_ID` until then
    #[serde(default = "Event::invalid_id")]
    pub id: i64,
    /// Stamped by the stream at add time
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Stamped by the stream at add time
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<EventSource>,
    /// Kind-specific body
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Optional annotation from an external security analyzer
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub security_risk: Option<SecurityRisk>,
    /// Injected for routing when the event crosses a broker; absent locally
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
}

impl Event {
    /// Sentinel id carried by events that have not been added to a stream yet.
    pub const INVALID_ID: i64 = -1;

    const fn invalid_id() -> i64 {
        Self::INVALID_ID
    }

    /// Create an unassigned event with the given payload.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Self::INVALID_ID,
            timestamp: None,
            source: None,
            payload,
            security_risk: None,
            session_id: None,
        }
    }

    /// Create an unassigned message event.
    pub fn message(content: &str) -> Self {
        Self::new(EventPayload::Message {
            content: content.to_string(),
        })
    }

    /// Create an unassigned finish event.
    pub fn finish(outputs: &str) -> Self {
        Self::new(EventPayload::Finish {
            outputs: outputs.to_string(),
        })
    }

    /// Create an unassigned state-change event.
    pub fn state_change(state: &str) -> Self {
        Self::new(EventPayload::StateChange {
            state: state.to_string(),
        })
    }

    /// Whether this event has been assigned an id by a stream.
    pub fn has_id(&self) -> bool {
        self.id != Self::INVALID_ID
    }

    /// The `kind` tag of this event's payload.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// A user-authored message action - the opening of a task chunk.
    pub fn is_user_message(&self) -> bool {
        self.source == Some(EventSource::User)
            && matches!(self.payload, EventPayload::Message { .. })
    }

    /// An agent-authored message action - a task conclusion.
    pub fn is_agent_message(&self) -> bool {
        self.source == Some(EventSource::Agent)
            && matches!(self.payload, EventPayload::Message { .. })
    }

    /// A finish action from the agent.
    pub fn is_finish(&self) -> bool {
        self.source == Some(EventSource::Agent)
            && matches!(self.payload, EventPayload::Finish { .. })
    }

    /// True for the events that close a task chunk (agent message or finish).
    pub fn is_chunk_end(&self) -> bool {
        self.is_agent_message() || self.is_finish()
    }

    /// A file-edit observation - kept by the task-completion condenser.
    pub fn is_file_edit_observation(&self) -> bool {
        matches!(self.payload, EventPayload::FileEditObservation { .. })
    }

    /// A browser observation - windowed by the browser-output condenser.
    pub fn is_browser_output(&self) -> bool {
        matches!(self.payload, EventPayload::BrowserOutput { .. })
    }

    /// The bulky event classes the token-length condenser removes: tool
    /// invocations and outputs, file I/O, browser/MCP/delegation traffic and
    /// agent thoughts. Messages, finishes, state changes and condensation
    /// markers are never bulky.
    pub fn is_bulky(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Think { .. }
                | EventPayload::CommandRun { .. }
                | EventPayload::CommandOutput { .. }
                | EventPayload::FileRead { .. }
                | EventPayload::FileWrite { .. }
                | EventPayload::FileEdit { .. }
                | EventPayload::FileReadObservation { .. }
                | EventPayload::FileEditObservation { .. }
                | EventPayload::BrowserNavigate { .. }
                | EventPayload::BrowserOutput { .. }
                | EventPayload::McpCall { .. }
                | EventPayload::McpObservation { .. }
                | EventPayload::TaskDelegate { .. }
                | EventPayload::DelegateObservation { .. }
        )
    }

    /// The human-readable text content of this event, if it has one.
    pub fn content(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Message { content }
            | EventPayload::CommandOutput { output: content }
            | EventPayload::FileReadObservation { content, .. }
            | EventPayload::FileEditObservation { content, .. }
            | EventPayload::BrowserOutput { content }
            | EventPayload::McpObservation { content }
            | EventPayload::DelegateObservation { content } => Some(content),
            EventPayload::Finish { outputs } => Some(outputs),
            EventPayload::Think { thought } => Some(thought),
            _ => None,
        }
    }
}
