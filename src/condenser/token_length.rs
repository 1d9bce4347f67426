//! Rolling token-pressure relief.
//!
//! Triggered by the measured prompt size of the previous step rather than an
//! estimate of the current view. Everything from the most recent user message
//! on is the live task and stays verbatim; before it, bulky tool traffic is
//! dropped outright and a summary of each role's messages is written into that
//! role's first retained message. The later messages of each role keep their
//! content, identity and order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::warn;

use crate::agent::Summarizer;
use crate::condenser::{Condensed, Condenser, RollingMetrics, SummaryFailurePolicy, View};
use crate::error::{LoomError, Result};
use crate::events::event::{Event, EventPayload};

const SUMMARY_PROMPT: &str = "Condense the following conversation messages into a short \
summary that preserves the goals, decisions and outcomes.";

/// Shrinks the view when the previous prompt exceeded `max_tokens`.
pub struct TokenLengthCondenser {
    max_tokens: u64,
    summarizer: Arc<dyn Summarizer>,
    policy: SummaryFailurePolicy,
    summarize_timeout: Duration,
}

impl TokenLengthCondenser {
    pub fn new(
        max_tokens: u64,
        summarizer: Arc<dyn Summarizer>,
        policy: SummaryFailurePolicy,
        summarize_timeout: Duration,
    ) -> Self {
        Self {
            max_tokens,
            summarizer,
            policy,
            summarize_timeout,
        }
    }

    /// Write a summary of the events at `indices` (all the same role) into
    /// the first of them. The later events keep their original content and
    /// identity; on summarizer failure nothing changes under
    /// `KeepUnsummarized`.
    async fn merge_role(&self, retained: &mut [Event], indices: &[usize]) -> Result<()> {
        if indices.len() < 2 {
            return Ok(());
        }
        let joined = indices
            .iter()
            .filter_map(|&i| retained[i].content())
            .collect::<Vec<_>>()
            .join("\n\n");
        let summarize = self.summarizer.summarize(SUMMARY_PROMPT, &joined);
        let summary = match timeout(self.summarize_timeout, summarize).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                return self.on_failure(format!("summarization failed: {}", e));
            }
            Err(_) => {
                return self.on_failure(format!(
                    "summarization timed out after {}ms",
                    self.summarize_timeout.as_millis()
                ));
            }
        };
        retained[indices[0]].payload = EventPayload::Message { content: summary };
        Ok(())
    }

    fn on_failure(&self, message: String) -> Result<()> {
        match self.policy {
            SummaryFailurePolicy::KeepUnsummarized => {
                warn!(
                    "{}; keeping the affected messages with their original content",
                    message
                );
                Ok(())
            }
            SummaryFailurePolicy::Fail => Err(LoomError::Condenser(message)),
        }
    }
}

#[async_trait]
impl Condenser for TokenLengthCondenser {
    fn name(&self) -> &'static str {
        "token_length"
    }

    fn should_condense(&self, _view: &View, metrics: &RollingMetrics) -> bool {
        metrics.previous_token_count > self.max_tokens
    }

    async fn condense(&self, view: &View, metrics: &RollingMetrics) -> Result<Condensed> {
        if !self.should_condense(view, metrics) {
            // At or under the threshold this stage is the identity.
            return Ok(Condensed::View(view.clone()));
        }
        let events = view.events();
        let Some(cut) = events.iter().rposition(|e| e.is_user_message()) else {
            return Ok(Condensed::View(view.clone()));
        };

        let mut retained: Vec<Event> = events[..cut]
            .iter()
            .filter(|e| !e.is_bulky())
            .cloned()
            .collect();

        let user_indices: Vec<usize> = retained
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_user_message())
            .map(|(i, _)| i)
            .collect();
        let agent_indices: Vec<usize> = retained
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_agent_message())
            .map(|(i, _)| i)
            .collect();
        self.merge_role(&mut retained, &user_indices).await?;
        self.merge_role(&mut retained, &agent_indices).await?;

        retained.extend(events[cut..].iter().cloned());
        Ok(Condensed::View(View::new(retained)))
    }
}
