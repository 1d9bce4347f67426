//! Contracts for the components that live outside the core: the reasoning
//! agent that produces events and the LLM-backed summarizer the token-length
//! condenser calls into. Both are trait seams so sessions and condensers can
//! be tested with scripted stand-ins.

use async_trait::async_trait;

use crate::condenser::View;
use crate::error::Result;
use crate::events::event::Event;

/// One reasoning step: given the condensed history, produce the next event.
///
/// Returning `Ok(None)` means there is nothing to do this step; the session
/// loop treats that as the agent yielding until new input arrives.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn step(&self, view: &View) -> Result<Option<Event>>;
}

/// The blocking "summarize this text" LLM call.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, text: &str) -> Result<String>;
}
