//! Chains condenser stages into one strategy.
//!
//! Stages run in their configured order, each seeing the view the previous
//! stage produced. A stage that yields a [`Condensation`] stops the pipeline
//! immediately; the marker must reach the log before further shrinking makes
//! sense.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::condenser::{Condensed, Condenser, RollingMetrics, View};
use crate::error::Result;

/// Before/after event counts for one executed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    pub stage: &'static str,
    pub before: usize,
    pub after: usize,
}

/// Outcome of one pipeline pass, with per-stage statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub outcome: Condensed,
    pub stages: Vec<StageStats>,
}

/// Fixed sequence of condenser stages.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use eventloom::condenser::{
///     BrowserOutputCondenser, CondenserPipeline, TaskCompletionCondenser,
/// };
///
/// let pipeline = CondenserPipeline::new(vec![
///     Arc::new(TaskCompletionCondenser::new()),
///     Arc::new(BrowserOutputCondenser::new(3)),
/// ]);
/// assert_eq!(pipeline.len(), 2);
/// ```
pub struct CondenserPipeline {
    stages: Vec<Arc<dyn Condenser>>,
}

impl CondenserPipeline {
    pub fn new(stages: Vec<Arc<dyn Condenser>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every applicable stage, threading the shrinking view through.
    pub async fn run(&self, view: &View, metrics: &RollingMetrics) -> Result<PipelineRun> {
        let mut current = view.clone();
        let mut stages = Vec::new();
        for stage in &self.stages {
            if !stage.should_condense(&current, metrics) {
                continue;
            }
            let before = current.len();
            match stage.condense(&current, metrics).await? {
                Condensed::View(next) => {
                    stages.push(StageStats {
                        stage: stage.name(),
                        before,
                        after: next.len(),
                    });
                    current = next;
                }
                Condensed::Condensation(condensation) => {
                    stages.push(StageStats {
                        stage: stage.name(),
                        before,
                        after: before,
                    });
                    debug!(stage = stage.name(), "pipeline short-circuited on a condensation");
                    return Ok(PipelineRun {
                        outcome: Condensed::Condensation(condensation),
                        stages,
                    });
                }
            }
        }
        Ok(PipelineRun {
            outcome: Condensed::View(current),
            stages,
        })
    }
}

#[async_trait]
impl Condenser for CondenserPipeline {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn should_condense(&self, view: &View, metrics: &RollingMetrics) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.should_condense(view, metrics))
    }

    async fn condense(&self, view: &View, metrics: &RollingMetrics) -> Result<Condensed> {
        let run = self.run(view, metrics).await?;
        for stats in &run.stages {
            debug!(
                stage = stats.stage,
                before = stats.before,
                after = stats.after,
                "condenser stage applied"
            );
        }
        Ok(run.outcome)
    }
}
