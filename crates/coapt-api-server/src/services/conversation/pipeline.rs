use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::database::models::ListingSummary;
use crate::services::context::{merge, SearchContext};
use crate::services::gateway::SortOrder;
use crate::services::query_analyzer::QueryIntent;

use super::types::Turn;

/// Mutable state threaded through one turn of the pipeline.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub thread_id: String,
    pub message: String,
    pub history: Vec<Turn>,
    /// Stored thread context folded with the client's existing context.
    pub base: SearchContext,
    /// Filters extracted from this turn's message.
    pub incoming: SearchContext,
    pub intent: QueryIntent,
    pub sort: SortOrder,
    pub validation_issue: Option<String>,
    pub suggestions: Vec<String>,
    pub retries: u32,
    pub listings: Option<Vec<ListingSummary>>,
    pub reply: Option<String>,
    /// Stage names in execution order, including repeats.
    pub trace: Vec<&'static str>,
}

impl TurnContext {
    pub fn new(
        thread_id: impl Into<String>,
        message: impl Into<String>,
        history: Vec<Turn>,
        base: SearchContext,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            message: message.into(),
            history,
            base,
            incoming: SearchContext::default(),
            intent: QueryIntent::NewSearch,
            sort: SortOrder::default(),
            validation_issue: None,
            suggestions: Vec::new(),
            retries: 0,
            listings: None,
            reply: None,
            trace: Vec::new(),
        }
    }

    /// The filters a search would run with right now.
    pub fn merged(&self) -> SearchContext {
        merge(&self.base, &self.incoming)
    }
}

/// What the pipeline should run after a stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Next,
    JumpTo(&'static str),
    Finish,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, turn: &mut TurnContext) -> anyhow::Result<StageFlow>;
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {error:#}")]
pub struct StageFailure {
    pub stage: &'static str,
    pub error: anyhow::Error,
}

/// Ordered, named stages with explicit jumps and a step budget.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    max_steps: Option<usize>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    pub async fn run(&self, turn: &mut TurnContext) -> Result<(), StageFailure> {
        let budget = self.max_steps.unwrap_or(self.stages.len() * 4);
        let mut index = 0;
        let mut steps = 0;

        while let Some(stage) = self.stages.get(index) {
            steps += 1;
            if steps > budget {
                warn!("Pipeline step budget ({}) exhausted at {}", budget, stage.name());
                return Err(StageFailure {
                    stage: stage.name(),
                    error: anyhow::anyhow!("step budget of {} exhausted", budget),
                });
            }

            let started = Instant::now();
            turn.trace.push(stage.name());
            let flow = stage.run(turn).await.map_err(|error| StageFailure {
                stage: stage.name(),
                error,
            })?;
            debug!(
                "Stage {} on thread {} -> {:?} ({:?})",
                stage.name(),
                turn.thread_id,
                flow,
                started.elapsed()
            );

            index = match flow {
                StageFlow::Next => index + 1,
                StageFlow::Finish => break,
                StageFlow::JumpTo(target) => {
                    self.position(target).ok_or_else(|| StageFailure {
                        stage: stage.name(),
                        error: anyhow::anyhow!("jump to unknown stage `{}`", target),
                    })?
                }
            };
        }

        Ok(())
    }
}
