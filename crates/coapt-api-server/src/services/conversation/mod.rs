//! Conversation threads: versioned storage, per-thread serialization and
//! the staged turn pipeline.

pub mod error;
mod lease;
pub mod manager;
pub mod pipeline;
pub mod stages;
pub mod store;
pub mod types;

pub use error::ConversationError;
pub use lease::{ThreadLease, ThreadLeases};
pub use manager::ConversationManager;
pub use pipeline::{Pipeline, Stage, StageFailure, StageFlow, TurnContext};
pub use stages::{build_pipeline, FilterExtractor};
pub use store::{InMemoryThreadStore, StoreError, ThreadStore};
pub use types::{ConversationThread, Role, ThreadState, Turn, TurnOutcome};
