//! Drops the working noise of completed tasks.
//!
//! A task chunk runs from a user message action to the next agent message or
//! finish action, both inclusive. Once a chunk has closed, the intermediate
//! traffic (commands, thoughts, tool calls) no longer informs future steps;
//! only the request, any file-edit observations and the conclusion do.

use async_trait::async_trait;

use crate::condenser::{Condensed, Condenser, RollingMetrics, View};
use crate::error::Result;
use crate::events::event::Event;

/// Keeps, per closed chunk: the opening user message, file-edit observations
/// and the closing agent message or finish. Events outside any closed chunk
/// are kept in full, so the task in progress is never touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskCompletionCondenser;

impl TaskCompletionCondenser {
    pub fn new() -> Self {
        Self
    }

    fn reduce(view: &View) -> Vec<Event> {
        let events = view.events();
        let mut kept = Vec::with_capacity(events.len());
        let mut i = 0;
        while i < events.len() {
            if !events[i].is_user_message() {
                kept.push(events[i].clone());
                i += 1;
                continue;
            }
            // Opening of a chunk; look for its close.
            let close = events[i + 1..]
                .iter()
                .position(|e| e.is_chunk_end())
                .map(|offset| i + 1 + offset);
            let Some(close) = close else {
                // Unclosed chunk: the task is still in progress, keep it all.
                kept.extend(events[i..].iter().cloned());
                break;
            };
            kept.push(events[i].clone());
            for event in &events[i + 1..close] {
                if event.is_file_edit_observation() {
                    kept.push(event.clone());
                }
            }
            kept.push(events[close].clone());
            i = close + 1;
        }
        kept
    }
}

#[async_trait]
impl Condenser for TaskCompletionCondenser {
    fn name(&self) -> &'static str {
        "task_completion"
    }

    fn should_condense(&self, view: &View, _metrics: &RollingMetrics) -> bool {
        Self::reduce(view).len() < view.len()
    }

    async fn condense(&self, view: &View, _metrics: &RollingMetrics) -> Result<Condensed> {
        Ok(Condensed::View(View::new(Self::reduce(view))))
    }
}
