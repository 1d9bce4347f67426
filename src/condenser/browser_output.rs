//! Windows browser observations down to the recent ones.
//!
//! Accessibility trees and page dumps are huge and go stale the moment the
//! agent navigates again. Only the last few observations stay verbatim;
//! earlier ones are masked in place so the view keeps its shape and ids.

use async_trait::async_trait;

use crate::condenser::{Condensed, Condenser, RollingMetrics, View};
use crate::error::Result;
use crate::events::event::{Event, EventPayload};

/// Placeholder written over masked browser observations.
pub const MASKED_OBSERVATION: &str =
    "Content omitted; the page was observed again more recently.";

/// Keeps the last `attention_window` browser observations verbatim and masks
/// the content of every earlier one. Identity (id, timestamp, source) and
/// ordering are preserved for all events.
#[derive(Debug, Clone, Copy)]
pub struct BrowserOutputCondenser {
    attention_window: usize,
}

impl BrowserOutputCondenser {
    pub fn new(attention_window: usize) -> Self {
        Self { attention_window }
    }

    fn browser_outputs(view: &View) -> usize {
        view.iter().filter(|e| e.is_browser_output()).count()
    }
}

#[async_trait]
impl Condenser for BrowserOutputCondenser {
    fn name(&self) -> &'static str {
        "browser_output"
    }

    fn should_condense(&self, view: &View, _metrics: &RollingMetrics) -> bool {
        Self::browser_outputs(view) > self.attention_window
    }

    async fn condense(&self, view: &View, _metrics: &RollingMetrics) -> Result<Condensed> {
        let total = Self::browser_outputs(view);
        let to_mask = total.saturating_sub(self.attention_window);
        let mut seen = 0;
        let events: Vec<Event> = view
            .iter()
            .map(|event| {
                if !event.is_browser_output() {
                    return event.clone();
                }
                seen += 1;
                if seen <= to_mask {
                    let mut masked = event.clone();
                    masked.payload = EventPayload::BrowserOutput {
                        content: MASKED_OBSERVATION.to_string(),
                    };
                    masked
                } else {
                    event.clone()
                }
            })
            .collect();
        Ok(Condensed::View(View::new(events)))
    }
}
