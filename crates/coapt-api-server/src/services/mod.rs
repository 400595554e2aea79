pub mod context;
pub mod conversation;
pub mod gateway;
pub mod llm_service;
pub mod neighborhoods;
pub mod query_analyzer;
pub mod share;

pub use conversation::ConversationManager;
pub use gateway::{SearchGateway, StaticGateway};
pub use llm_service::LlmFilterExtractor;
pub use neighborhoods::NeighborhoodDirectory;
pub use query_analyzer::RuleBasedExtractor;
pub use share::SharedSessionCache;
