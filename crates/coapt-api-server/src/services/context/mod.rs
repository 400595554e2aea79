//! Typed, mergeable search context carried across conversation turns

mod merge;
pub mod types;

pub use merge::merge;
pub use types::{ContextError, SearchContext, SeqField};
