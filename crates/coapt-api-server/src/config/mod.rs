pub mod settings;

pub use settings::{
    ActivityLogConfig, ConversationConfig, DatabaseConfig, LimitsConfig, LlmConfig, RedisConfig,
    ServerConfig, Settings, SharingConfig,
};
