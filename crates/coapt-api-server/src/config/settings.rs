use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub conversation: ConversationConfig,
    pub sharing: SharingConfig,
    pub redis: RedisConfig,
    pub llm: LlmConfig,
    pub activity_log: ActivityLogConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// An empty `url` runs the server without Postgres: threads live in memory
/// and listings come from the bundled sample data.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_max_size: 10,
            pool_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConversationConfig {
    pub thread_idle_ttl_seconds: u64,
    pub max_commit_attempts: u32,
    pub max_validation_retries: u32,
    pub result_limit: usize,
    pub maintenance_interval_seconds: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            thread_idle_ttl_seconds: 7 * 24 * 60 * 60,
            max_commit_attempts: 3,
            max_validation_retries: 2,
            result_limit: 20,
            maintenance_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SharingConfig {
    pub idle_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub max_id_attempts: usize,
    /// Prefix of the public share URL returned on create.
    pub public_path: String,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            idle_ttl_seconds: 24 * 60 * 60,
            sweep_interval_seconds: 60,
            max_id_attempts: 8,
            public_path: "/s".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "share".to_string(),
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// Off means filters come from the rule-based extractor.
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub max_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:8081".to_string(),
            model: "local".to_string(),
            timeout_seconds: 30,
            max_tokens: 512,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ActivityLogConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
}

impl Default for ActivityLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub db_search_concurrency: usize,
    pub llm_generate_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            db_search_concurrency: 16,
            llm_generate_concurrency: 4,
            acquire_timeout_ms: 5000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
