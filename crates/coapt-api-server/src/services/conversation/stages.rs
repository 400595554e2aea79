//! The fixed stage sequence run for every chat turn.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::services::context::SearchContext;
use crate::services::gateway::{ListingPage, SearchGateway};
use crate::services::neighborhoods::NeighborhoodDirectory;
use crate::services::query_analyzer::{QueryAnalyzer, QueryIntent};
use crate::utils::limiters::Limiters;

use super::pipeline::{Pipeline, Stage, StageFlow, TurnContext};

pub const CLASSIFY_INTENT: &str = "classify_intent";
pub const EXTRACT_FILTERS: &str = "extract_filters";
pub const VALIDATE_FILTERS: &str = "validate_filters";
pub const EXECUTE_SEARCH: &str = "execute_search";
pub const SYNTHESIZE_RESPONSE: &str = "synthesize_response";

/// Turns a free-text message into structured filters.
#[async_trait]
pub trait FilterExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `hint` carries the previous attempt's validation problem on retries.
    async fn extract(
        &self,
        message: &str,
        current: &SearchContext,
        hint: Option<&str>,
    ) -> Result<SearchContext>;
}

pub struct ClassifyIntent;

#[async_trait]
impl Stage for ClassifyIntent {
    fn name(&self) -> &'static str {
        CLASSIFY_INTENT
    }

    async fn run(&self, turn: &mut TurnContext) -> Result<StageFlow> {
        turn.intent = QueryAnalyzer::analyze_intent(&turn.message, !turn.base.is_empty());
        if turn.intent == QueryIntent::Clarification {
            return Ok(StageFlow::JumpTo(SYNTHESIZE_RESPONSE));
        }
        Ok(StageFlow::Next)
    }
}

pub struct ExtractFilters {
    extractor: Arc<dyn FilterExtractor>,
}

impl ExtractFilters {
    pub fn new(extractor: Arc<dyn FilterExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Stage for ExtractFilters {
    fn name(&self) -> &'static str {
        EXTRACT_FILTERS
    }

    async fn run(&self, turn: &mut TurnContext) -> Result<StageFlow> {
        let hint = turn.validation_issue.clone();
        turn.incoming = self
            .extractor
            .extract(&turn.message, &turn.base, hint.as_deref())
            .await?;

        debug!(
            "Extractor {} produced {} for thread {}",
            self.extractor.name(),
            turn.incoming.to_value(),
            turn.thread_id
        );

        if turn.incoming.is_empty() && turn.base.is_empty() {
            turn.intent = QueryIntent::Clarification;
            return Ok(StageFlow::JumpTo(SYNTHESIZE_RESPONSE));
        }
        Ok(StageFlow::Next)
    }
}

pub struct ValidateFilters {
    neighborhoods: Arc<NeighborhoodDirectory>,
    max_retries: u32,
}

impl ValidateFilters {
    pub fn new(neighborhoods: Arc<NeighborhoodDirectory>, max_retries: u32) -> Self {
        Self {
            neighborhoods,
            max_retries,
        }
    }

    fn is_unknown_neighborhood(&self, name: Option<&str>) -> bool {
        name.is_some_and(|n| !self.neighborhoods.is_empty() && self.neighborhoods.canonical(n).is_none())
    }

    fn find_issue(&self, turn: &mut TurnContext) -> Option<String> {
        turn.suggestions.clear();

        if let Some(name) = turn.incoming.neighborhood.clone() {
            if !self.neighborhoods.is_empty() {
                match self.neighborhoods.canonical(&name) {
                    Some(canonical) => turn.incoming.neighborhood = Some(canonical),
                    None => {
                        turn.suggestions = self.neighborhoods.suggest(&name, 3);
                        return Some(format!("I don't know a neighborhood called \"{}\"", name));
                    }
                }
            }
        }

        turn.merged().validate().err().map(|e| e.to_string())
    }
}

#[async_trait]
impl Stage for ValidateFilters {
    fn name(&self) -> &'static str {
        VALIDATE_FILTERS
    }

    async fn run(&self, turn: &mut TurnContext) -> Result<StageFlow> {
        let Some(issue) = self.find_issue(turn) else {
            turn.validation_issue = None;
            return Ok(StageFlow::Next);
        };

        if turn.retries < self.max_retries {
            turn.retries += 1;
            warn!(
                "Validation failed on thread {} (retry {}/{}): {}",
                turn.thread_id, turn.retries, self.max_retries, issue
            );
            turn.validation_issue = Some(issue);
            return Ok(StageFlow::JumpTo(EXTRACT_FILTERS));
        }

        info!(
            "Validation retries exhausted on thread {}, asking for clarification",
            turn.thread_id
        );
        turn.validation_issue = Some(issue);
        if self.is_unknown_neighborhood(turn.incoming.neighborhood.as_deref()) {
            turn.incoming.neighborhood = None;
        }
        if turn.merged().validate().is_err() {
            turn.incoming = SearchContext::default();
        }
        turn.intent = QueryIntent::Clarification;
        Ok(StageFlow::JumpTo(SYNTHESIZE_RESPONSE))
    }
}

pub struct ExecuteSearch {
    gateway: Arc<dyn SearchGateway>,
    limiters: Arc<Limiters>,
    limit: usize,
}

impl ExecuteSearch {
    pub fn new(gateway: Arc<dyn SearchGateway>, limiters: Arc<Limiters>, limit: usize) -> Self {
        Self {
            gateway,
            limiters,
            limit,
        }
    }
}

#[async_trait]
impl Stage for ExecuteSearch {
    fn name(&self) -> &'static str {
        EXECUTE_SEARCH
    }

    async fn run(&self, turn: &mut TurnContext) -> Result<StageFlow> {
        let filters = turn.merged();
        let (_permit, waited) = Limiters::acquire_timed(
            self.limiters.db_search.clone(),
            self.limiters.acquire_timeout,
            "listing_search",
        )
        .await?;

        let page = ListingPage::first(self.limit).sorted(turn.sort);
        let listings = self.gateway.search_listings(&filters, page).await?;
        debug!(
            "Search for thread {} returned {} listings (queued {:?})",
            turn.thread_id,
            listings.len(),
            waited
        );

        turn.listings = Some(listings);
        Ok(StageFlow::Next)
    }
}

pub struct SynthesizeResponse;

#[async_trait]
impl Stage for SynthesizeResponse {
    fn name(&self) -> &'static str {
        SYNTHESIZE_RESPONSE
    }

    async fn run(&self, turn: &mut TurnContext) -> Result<StageFlow> {
        let reply = if turn.intent == QueryIntent::Clarification {
            clarification_reply(turn.validation_issue.as_deref(), &turn.suggestions)
        } else {
            let count = turn.listings.as_ref().map_or(0, Vec::len);
            results_reply(count, &turn.merged())
        };

        turn.reply = Some(reply);
        Ok(StageFlow::Finish)
    }
}

/// Assemble the standard chat pipeline.
pub fn build_pipeline(
    extractor: Arc<dyn FilterExtractor>,
    neighborhoods: Arc<NeighborhoodDirectory>,
    gateway: Arc<dyn SearchGateway>,
    limiters: Arc<Limiters>,
    max_validation_retries: u32,
    result_limit: usize,
) -> Pipeline {
    Pipeline::new()
        .then(ClassifyIntent)
        .then(ExtractFilters::new(extractor))
        .then(ValidateFilters::new(neighborhoods, max_validation_retries))
        .then(ExecuteSearch::new(gateway, limiters, result_limit))
        .then(SynthesizeResponse)
}

/// 3000 -> "3,000"
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn describe_filters(filters: &SearchContext) -> Vec<String> {
    let mut parts = Vec::new();

    match (filters.min_price, filters.max_price) {
        (Some(min), Some(max)) => parts.push(format!(
            "${} - ${}",
            format_thousands(min),
            format_thousands(max)
        )),
        (None, Some(max)) => parts.push(format!("under ${}", format_thousands(max))),
        (Some(min), None) => parts.push(format!("over ${}", format_thousands(min))),
        (None, None) => {}
    }

    match filters.bedrooms {
        Some(0) => parts.push("studio".to_string()),
        Some(1) => parts.push("1 bedroom".to_string()),
        Some(n) => parts.push(format!("{} bedrooms", n)),
        None => {}
    }

    if let Some(neighborhood) = &filters.neighborhood {
        parts.push(format!("in {}", neighborhood));
    } else if let Some(borough) = &filters.borough {
        parts.push(format!("in {}", borough));
    }

    if filters.no_fee == Some(true) {
        parts.push("no broker fee".to_string());
    }

    if !filters.tags.values.is_empty() {
        parts.push(
            filters
                .tags
                .values
                .iter()
                .take(2)
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    parts
}

fn results_reply(count: usize, filters: &SearchContext) -> String {
    let parts = describe_filters(filters);
    match (count, parts.is_empty()) {
        (0, _) => "No apartments found matching your criteria. Try broadening your search.".to_string(),
        (1, true) => "Found 1 apartment matching your search.".to_string(),
        (1, false) => format!("Found 1 apartment {}.", parts.join(", ")),
        (n, true) => format!("Found {} apartments matching your search.", n),
        (n, false) => format!("Found {} apartments {}.", n, parts.join(", ")),
    }
}

fn clarification_reply(issue: Option<&str>, suggestions: &[String]) -> String {
    match (issue, suggestions) {
        (Some(issue), []) => format!("Sorry, I couldn't use that search: {}.", issue),
        (Some(issue), [only]) => {
            format!("Sorry, I couldn't use that search: {}. Did you mean {}?", issue, only)
        }
        (Some(issue), many) => format!(
            "Sorry, I couldn't use that search: {}. Did you mean one of {}?",
            issue,
            many.join(", ")
        ),
        (None, _) => "Tell me what you're looking for. A neighborhood, a budget or a bedroom count is a good start.".to_string(),
    }
}
