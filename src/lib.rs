//! EventLoom - append-only event logs, conversation scheduling and context
//! condensation for multi-agent conversation platforms

pub mod agent;
pub mod condenser;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod storage;
pub mod utils;

pub use agent::{Agent, Summarizer};
pub use condenser::{
    Condensation, Condensed, Condenser, CondenserPipeline, RollingMetrics, SummaryFailurePolicy,
    View,
};
pub use config::Config;
pub use error::{LoomError, Result};
pub use events::{
    Broker, Event, EventPayload, EventSource, EventStore, EventStream, InMemoryBroker,
    SubscriberKind,
};
pub use manager::{AgentState, Conversation, ConversationManager, Runtime, Session};
pub use storage::{FileStore, InMemoryFileStore, LocalFileStore};
