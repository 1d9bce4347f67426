//! Condenser module - bounded context windows over unbounded histories
//!
//! A condenser takes an ordered [`View`] of a conversation and either returns
//! a smaller view or a [`Condensation`] marker describing a summarized range.
//! Condensers are pure over their inputs: the same view and metrics always
//! produce the same result, and the input view is never mutated.
//!
//! Concrete strategies live in the submodules; [`pipeline`] chains them.

pub mod browser_output;
pub mod pipeline;
pub mod task_completion;
pub mod token_length;

pub use browser_output::{BrowserOutputCondenser, MASKED_OBSERVATION};
pub use pipeline::{CondenserPipeline, PipelineRun, StageStats};
pub use task_completion::TaskCompletionCondenser;
pub use token_length::TokenLengthCondenser;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::event::{Event, EventPayload};

/// An ordered, immutable snapshot of a conversation's events.
///
/// Views are rebuilt from the stream on every agent step; condensers shrink
/// them by constructing new views, never by mutating in place.
///
/// # Example
/// ```
/// use eventloom::condenser::View;
/// use eventloom::events::Event;
///
/// let view = View::new(vec![Event::message("a"), Event::message("b")]);
/// assert_eq!(view.len(), 2);
/// assert_eq!(view[1].content(), Some("b"));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct View {
    events: Vec<Event>,
}

impl View {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// The events as a slice, in id order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consume the view, yielding its events.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

impl std::ops::Index<usize> for View {
    type Output = Event;

    fn index(&self, index: usize) -> &Event {
        &self.events[index]
    }
}

impl From<Vec<Event>> for View {
    fn from(events: Vec<Event>) -> Self {
        Self::new(events)
    }
}

impl<'a> IntoIterator for &'a View {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// A summarized range of history, distinct from a shrunken [`View`].
///
/// The pipeline stops when a stage produces one of these; the caller persists
/// it into the log as a condensation event.
#[derive(Debug, Clone, PartialEq)]
pub struct Condensation {
    /// Replacement text for the forgotten range
    pub summary: String,
    /// First forgotten event id (inclusive)
    pub forgotten_first: i64,
    /// Last forgotten event id (inclusive)
    pub forgotten_last: i64,
}

impl Condensation {
    /// The unassigned event that records this condensation in the log.
    pub fn to_event(&self) -> Event {
        Event::new(EventPayload::Condensation {
            summary: self.summary.clone(),
            forgotten_first: self.forgotten_first,
            forgotten_last: self.forgotten_last,
        })
    }
}

/// Result of a condenser stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Condensed {
    View(View),
    Condensation(Condensation),
}

/// Rolling measurements carried between agent steps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollingMetrics {
    /// Token count of the previous step's prompt, as reported by the model
    pub previous_token_count: u64,
}

/// What to do when a summarization call fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryFailurePolicy {
    /// Retain the affected events with their original content
    #[default]
    KeepUnsummarized,
    /// Propagate the error to the caller
    Fail,
}

/// A history-shrinking strategy.
///
/// `should_condense` is a pure, cheap predicate; `condense` may call out (the
/// token-length stage summarizes through an LLM) but must stay deterministic
/// for fixed inputs and must not mutate the view it is given.
#[async_trait]
pub trait Condenser: Send + Sync {
    /// Short name used in stage statistics and logs.
    fn name(&self) -> &'static str;

    /// Whether `condense` would shrink this view.
    fn should_condense(&self, view: &View, metrics: &RollingMetrics) -> bool;

    /// Produce a smaller view or a condensation marker.
    async fn condense(&self, view: &View, metrics: &RollingMetrics) -> Result<Condensed>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_indexing_and_iteration() {
        let view = View::new(vec![
            Event::message("a"),
            Event::message("b"),
            Event::message("c"),
        ]);
        assert_eq!(view.len(), 3);
        assert!(!view.is_empty());
        assert_eq!(view[0].content(), Some("a"));
        let contents: Vec<_> = view.iter().filter_map(|e| e.content()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_condensation_to_event() {
        let condensation = Condensation {
            summary: "did things".into(),
            forgotten_first: 3,
            forgotten_last: 17,
        };
        let event = condensation.to_event();
        assert!(!event.has_id());
        assert_eq!(event.kind(), "condensation");
    }

    #[test]
    fn test_summary_failure_policy_default() {
        assert_eq!(
            SummaryFailurePolicy::default(),
            SummaryFailurePolicy::KeepUnsummarized
        );
    }
}
