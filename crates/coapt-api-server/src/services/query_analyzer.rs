/// Query Intent Analyzer and rule-based filter extraction
/// Detects whether a message starts a search, refines the current one,
/// or needs a clarifying reply, and pulls structured filters out of it.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::services::context::{SearchContext, SeqField};
use crate::services::conversation::stages::FilterExtractor;
use crate::services::neighborhoods::NeighborhoodDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// Fresh request for listings
    /// Examples: "show me 2 bed apartments in Williamsburg"
    NewSearch,

    /// Narrows or adjusts the running search
    /// Examples: "under $3000", "what about Bushwick instead?"
    Refinement,

    /// Nothing searchable; answer with guidance
    /// Examples: "hi", "what can you do?"
    Clarification,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewSearch => "new_search",
            Self::Refinement => "refinement",
            Self::Clarification => "clarification",
        }
    }
}

pub struct QueryAnalyzer;

impl QueryAnalyzer {
    /// Analyze query intent based on pattern matching
    pub fn analyze_intent(query: &str, has_context: bool) -> QueryIntent {
        let query_lower = query.to_lowercase();
        let has_digits = query_lower.chars().any(|c| c.is_ascii_digit());

        // Pattern 1: Small talk / help requests with no filter content
        let clarification_patterns = [
            "hello",
            "hi",
            "hey",
            "help",
            "what can you do",
            "how does this work",
            "thanks",
            "thank you",
        ];

        let trimmed = query_lower
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation());
        if !has_digits && clarification_patterns.contains(&trimmed) {
            debug!("Detected Clarification intent: matched '{}'", trimmed);
            return QueryIntent::Clarification;
        }

        // Pattern 2: Explicit new search
        let search_patterns = [
            "show me",
            "find me",
            "find",
            "search for",
            "looking for",
            "i want",
            "i need",
            "any apartments",
            "list ",
        ];

        for pattern in &search_patterns {
            if query_lower.contains(pattern) {
                debug!("Detected NewSearch intent: matched '{}'", pattern);
                return QueryIntent::NewSearch;
            }
        }

        // Pattern 3: Anything else on a thread with filters refines them
        if has_context {
            debug!("Detected Refinement intent (existing context)");
            return QueryIntent::Refinement;
        }

        debug!("No specific pattern matched, defaulting to NewSearch");
        QueryIntent::NewSearch
    }
}

static BEDROOMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d+|one|two|three|four|five|six)\s*(?:-\s*)?(?:bed(?:room)?s?|br|bd)\b")
        .expect("valid bedrooms regex")
});
static STUDIO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bstudios?\b").expect("valid studio regex"));
static BATHROOMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d+(?:\.\d+)?)\s*\+?\s*(?:bath(?:room)?s?|ba)\b").expect("valid bathrooms regex")
});
static PRICE_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?\s*(?:-|to)\s*\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?")
        .expect("valid price range regex")
});
static MAX_PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:under|below|less than|up to|at most|max(?:imum)?|no more than|cheaper than|<)\s*\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?")
        .expect("valid max price regex")
});
static MIN_PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:over|above|more than|at least|min(?:imum)?|starting at|>)\s*\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?")
        .expect("valid min price regex")
});
static SQFT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d[\d,]*)\s*\+?\s*(?:sq\.?\s*ft|sqft|square\s+feet|sf)\b").expect("valid sqft regex")
});
static ZIPCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^$\d,.])(1[01]\d{3})\b").expect("valid zipcode regex"));
static NO_FEE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bno[\s-]?(?:broker(?:'s)?\s*)?fee\b").expect("valid no fee regex"));
static REPLACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:instead|only)\b").expect("valid replace regex"));
static IN_PLACE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:in|near|around)\s+((?:[A-Z][\w'.-]*)(?:\s+[A-Z][\w'.-]*)*)")
        .expect("valid place regex")
});

const BOROUGHS: &[&str] = &["Manhattan", "Brooklyn", "Queens", "Bronx", "Staten Island"];

const PROPERTY_TYPES: &[(&str, &str)] = &[
    ("multi-family", "multi-family"),
    ("multifamily", "multi-family"),
    ("condop", "condop"),
    ("condo", "condo"),
    ("co-op", "coop"),
    ("coop", "coop"),
    ("townhouse", "townhouse"),
    ("townhome", "townhouse"),
    ("house", "house"),
    ("rental", "rental"),
    ("for rent", "rental"),
];

const AMENITIES: &[(&str, &str)] = &[
    ("doorman", "doorman"),
    ("elevator", "elevator"),
    ("gym", "gym"),
    ("fitness", "gym"),
    ("laundry", "laundry"),
    ("washer", "laundry"),
    ("dishwasher", "dishwasher"),
    ("pool", "pool"),
    ("roof deck", "roof deck"),
    ("rooftop", "roof deck"),
    ("parking", "parking"),
    ("garage", "parking"),
    ("balcony", "balcony"),
    ("terrace", "terrace"),
];

const TAGS: &[(&str, &str)] = &[
    ("pet friendly", "Pet Friendly"),
    ("pets allowed", "Pet Friendly"),
    ("dog", "Pet Friendly"),
    ("luxury", "Luxury"),
    ("renovated", "Renovated"),
    ("furnished", "Furnished"),
    ("spacious", "Spacious"),
    ("great deal", "Great Deal"),
    ("home office", "Home Office"),
];

fn word_number(s: &str) -> Option<u32> {
    match s {
        "one" => Some(1),
        "two" => Some(2),
        "three" => Some(3),
        "four" => Some(4),
        "five" => Some(5),
        "six" => Some(6),
        n => n.parse().ok(),
    }
}

fn parse_amount(digits: &str, thousands: bool) -> Option<u64> {
    let value: f64 = digits.replace(',', "").parse().ok()?;
    let value = if thousands { value * 1000.0 } else { value };
    (value.is_finite() && value >= 0.0).then(|| value.round() as u64)
}

/// True when the number ending at `end` is a room or area count, not money.
fn followed_by_unit(text: &str, end: usize) -> bool {
    let rest = text[end..].trim_start();
    ["bed", "br", "bd", "bath", "ba", "sq", "square", "room", "sf"]
        .iter()
        .any(|unit| rest.starts_with(unit))
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    let padded = format!(" {} ", text);
    padded.contains(&format!(" {} ", phrase))
        || padded.contains(&format!(" {}s ", phrase))
        || padded.contains(&format!(" {},", phrase))
        || padded.contains(&format!(" {}.", phrase))
        || padded.contains(&format!(" {}?", phrase))
}

/// Deterministic pattern-based extractor.
pub struct RuleBasedExtractor {
    neighborhoods: Arc<NeighborhoodDirectory>,
}

impl RuleBasedExtractor {
    pub fn new(neighborhoods: Arc<NeighborhoodDirectory>) -> Self {
        Self { neighborhoods }
    }

    /// Pull every recognised filter out of `message`.
    pub fn parse(&self, message: &str) -> SearchContext {
        let lower = message.to_lowercase();
        let mut ctx = SearchContext::default();

        if let Some(caps) = BEDROOMS_RE.captures(&lower) {
            ctx.bedrooms = word_number(&caps[1]);
        } else if STUDIO_RE.is_match(&lower) {
            ctx.bedrooms = Some(0);
        }

        if let Some(caps) = BATHROOMS_RE.captures(&lower) {
            ctx.min_bathrooms = caps[1].parse().ok();
        }

        if let Some(caps) = PRICE_RANGE_RE.captures(&lower) {
            ctx.min_price = parse_amount(&caps[1], caps.get(2).is_some());
            ctx.max_price = parse_amount(&caps[3], caps.get(4).is_some());
        } else {
            if let Some(caps) = MAX_PRICE_RE.captures(&lower) {
                let end = caps.get(0).map_or(0, |m| m.end());
                if !followed_by_unit(&lower, end) {
                    ctx.max_price = parse_amount(&caps[1], caps.get(2).is_some());
                }
            }
            if let Some(caps) = MIN_PRICE_RE.captures(&lower) {
                let end = caps.get(0).map_or(0, |m| m.end());
                if !followed_by_unit(&lower, end) {
                    ctx.min_price = parse_amount(&caps[1], caps.get(2).is_some());
                }
            }
        }

        if let Some(caps) = SQFT_RE.captures(&lower) {
            ctx.min_sqft = caps[1].replace(',', "").parse().ok();
        }

        if let Some(caps) = ZIPCODE_RE.captures(&lower) {
            let zip = &caps[1];
            let amount = zip.parse::<u64>().ok();
            if amount != ctx.max_price && amount != ctx.min_price {
                ctx.zipcode = Some(zip.to_string());
            }
        }

        if NO_FEE_RE.is_match(&lower) {
            ctx.no_fee = Some(true);
        }

        ctx.property_type = PROPERTY_TYPES
            .iter()
            .find(|(phrase, _)| contains_phrase(&lower, phrase))
            .map(|(_, canonical)| canonical.to_string());

        ctx.borough = BOROUGHS
            .iter()
            .find(|b| contains_phrase(&lower, &b.to_lowercase()))
            .map(|b| b.to_string());

        ctx.neighborhood = self.neighborhoods.find_in(message).or_else(|| {
            IN_PLACE_RE
                .captures(message)
                .map(|caps| caps[1].trim_end_matches(['.', ',', '?', '!']).to_string())
                .filter(|place| !BOROUGHS.iter().any(|b| b.eq_ignore_ascii_case(place)))
                // "move in June": only near-misses of a known name are worth a retry.
                .filter(|place| {
                    self.neighborhoods.is_empty() || !self.neighborhoods.suggest(place, 1).is_empty()
                })
        });

        let replace = REPLACE_RE.is_match(&lower);
        let amenities = collect_keywords(&lower, AMENITIES);
        let tags = collect_keywords(&lower, TAGS);
        ctx.amenities = seq(amenities, replace);
        ctx.tags = seq(tags, replace);

        ctx
    }
}

fn collect_keywords(text: &str, table: &[(&str, &str)]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for (phrase, canonical) in table {
        if contains_phrase(text, phrase) && !found.iter().any(|f| f == canonical) {
            found.push(canonical.to_string());
        }
    }
    found
}

fn seq(values: Vec<String>, replace: bool) -> SeqField {
    if values.is_empty() {
        SeqField::default()
    } else if replace {
        SeqField::replacing(values)
    } else {
        SeqField::append(values)
    }
}

#[async_trait]
impl FilterExtractor for RuleBasedExtractor {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn extract(
        &self,
        message: &str,
        _current: &SearchContext,
        _hint: Option<&str>,
    ) -> Result<SearchContext> {
        let ctx = self.parse(message);
        debug!("Rule-based extraction: {}", ctx.to_value());
        Ok(ctx)
    }
}
