use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use coapt_api_server::build_router;
use coapt_api_server::config::Settings;
use coapt_api_server::database::{DbPool, ListingRepository, PgThreadStore};
use coapt_api_server::logging::{ActivityLogger, LoggerConfig};
use coapt_api_server::services::conversation::{
    build_pipeline, ConversationManager, FilterExtractor, InMemoryThreadStore, ThreadStore,
};
use coapt_api_server::services::share::{connect_mirror, SessionCacheConfig, SharedSessionCache};
use coapt_api_server::services::{
    LlmFilterExtractor, NeighborhoodDirectory, RuleBasedExtractor, SearchGateway, StaticGateway,
};
use coapt_api_server::state::AppState;
use coapt_api_server::utils::limiters::Limiters;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,coapt_api_server=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("🚀 Starting CoApt API Server...");

    // Load configuration
    let settings = Arc::new(Settings::load()?);
    info!("✅ Configuration loaded");

    let limiters = Arc::new(Limiters::new(&settings.limits));
    let thread_ttl = Duration::from_secs(settings.conversation.thread_idle_ttl_seconds);

    // Storage: Postgres when configured, in-memory otherwise
    let (db_pool, gateway, store, logger): (
        Option<DbPool>,
        Arc<dyn SearchGateway>,
        Arc<dyn ThreadStore>,
        ActivityLogger,
    ) = if settings.database.is_configured() {
        let pool = DbPool::new(&settings.database).await?;
        info!("✅ Database connection established");

        let threads = PgThreadStore::new(pool.clone(), thread_ttl);
        threads.ensure_schema().await?;

        let logger = if settings.activity_log.enabled {
            ActivityLogger::ensure_schema(pool.get_pool()).await?;
            ActivityLogger::new(
                pool.get_pool().clone(),
                LoggerConfig::from(&settings.activity_log),
            )
        } else {
            ActivityLogger::disabled()
        };

        (
            Some(pool.clone()),
            Arc::new(ListingRepository::new(pool)),
            Arc::new(threads),
            logger,
        )
    } else {
        warn!("⚠️ No database configured, using in-memory threads and sample listings");
        (
            None,
            Arc::new(StaticGateway::sample()),
            Arc::new(InMemoryThreadStore::new(thread_ttl)),
            ActivityLogger::disabled(),
        )
    };

    // Neighborhood directory
    let neighborhoods = Arc::new(NeighborhoodDirectory::builtin());
    match gateway.neighborhoods().await {
        Ok(names) if !names.is_empty() => {
            info!("✅ Loaded {} neighborhoods", names.len());
            neighborhoods.replace(names);
        }
        Ok(_) => warn!("Neighborhood table empty, using built-in list"),
        Err(e) => warn!("⚠️ Could not load neighborhoods, using built-in list: {:#}", e),
    }

    // Filter extraction
    let extractor: Arc<dyn FilterExtractor> = if settings.llm.enabled {
        info!("✅ LLM filter extraction via {}", settings.llm.base_url);
        Arc::new(LlmFilterExtractor::new(settings.llm.clone(), limiters.clone())?)
    } else {
        info!("Rule-based filter extraction");
        Arc::new(RuleBasedExtractor::new(neighborhoods.clone()))
    };

    // Shared sessions
    let mirror = connect_mirror(
        settings.redis.enabled,
        &settings.redis.url,
        &settings.redis.key_prefix,
        Duration::from_millis(settings.redis.connect_timeout_ms),
    )
    .await;
    let sessions = Arc::new(SharedSessionCache::new(
        SessionCacheConfig::from(&settings.sharing),
        mirror,
        logger.clone(),
    ));
    tokio::spawn(sessions.clone().run_sweeper());

    // Conversation manager
    let pipeline = build_pipeline(
        extractor,
        neighborhoods,
        gateway.clone(),
        limiters.clone(),
        settings.conversation.max_validation_retries,
        settings.conversation.result_limit,
    );
    info!("✅ Chat pipeline: {:?}", pipeline.stage_names());

    let conversation_manager = Arc::new(
        ConversationManager::new(store, pipeline, logger)
            .with_sessions(sessions.clone())
            .with_max_commit_attempts(settings.conversation.max_commit_attempts),
    );

    {
        let manager = conversation_manager.clone();
        let every = Duration::from_secs(settings.conversation.maintenance_interval_seconds.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if let Err(e) = manager.purge_idle().await {
                    warn!("Thread maintenance failed: {}", e);
                }
            }
        });
    }

    let state = AppState {
        settings: settings.clone(),
        db_pool: db_pool.clone(),
        gateway,
        conversation_manager,
        sessions: sessions.clone(),
        limiters,
    };

    let app = build_router(state);

    // Server address
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    sessions.shutdown();
    if let Some(pool) = db_pool {
        pool.close().await;
    }
    info!("👋 Bye");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
