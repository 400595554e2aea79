use serde_json::json;
use std::sync::Arc;

use coapt_api_server::logging::ActivityLogger;
use coapt_api_server::services::context::SearchContext;
use coapt_api_server::services::conversation::{
    build_pipeline, ConversationManager, InMemoryThreadStore, ThreadState,
};
use coapt_api_server::services::share::{SessionSnapshot, SharedSessionCache};
use coapt_api_server::services::{NeighborhoodDirectory, RuleBasedExtractor, StaticGateway};
use coapt_api_server::utils::limiters::Limiters;

fn manager(sessions: Arc<SharedSessionCache>) -> Arc<ConversationManager> {
    let directory = Arc::new(NeighborhoodDirectory::builtin());
    let pipeline = build_pipeline(
        Arc::new(RuleBasedExtractor::new(directory.clone())),
        directory,
        Arc::new(StaticGateway::sample()),
        Arc::new(Limiters::default()),
        2,
        20,
    );
    Arc::new(
        ConversationManager::new(
            Arc::new(InMemoryThreadStore::default()),
            pipeline,
            ActivityLogger::disabled(),
        )
        .with_sessions(sessions),
    )
}

#[tokio::test]
async fn three_turn_search_accumulates_filters() {
    let manager = manager(Arc::new(SharedSessionCache::default()));

    let a = manager
        .invoke("show me 2 bed apartments in Williamsburg", "t1", Some(SearchContext::default()))
        .await
        .unwrap();
    assert_eq!(a.context.to_value(), json!({"neighborhood": "Williamsburg", "bedrooms": 2}));

    let b = manager.invoke("under $3000", "t1", Some(a.context)).await.unwrap();
    assert_eq!(
        b.context.to_value(),
        json!({"neighborhood": "Williamsburg", "bedrooms": 2, "maxPrice": 3000})
    );

    let c = manager.invoke("no fee with laundry", "t1", Some(b.context)).await.unwrap();
    assert_eq!(c.context.neighborhood.as_deref(), Some("Williamsburg"));
    assert_eq!(c.context.bedrooms, Some(2));
    assert_eq!(c.context.max_price, Some(3000));
    assert_eq!(c.context.no_fee, Some(true));

    let thread = manager.load_thread("t1").await.unwrap().unwrap();
    assert_eq!(thread.history.len(), 6);
    assert_eq!(thread.state, ThreadState::Idle);
}

#[tokio::test]
async fn threads_do_not_share_context() {
    let manager = manager(Arc::new(SharedSessionCache::default()));

    let (x, y) = tokio::join!(
        manager.invoke("2 bed apartments in Williamsburg", "x", None),
        manager.invoke("studios in Astoria", "y", None),
    );

    assert_eq!(x.unwrap().context.neighborhood.as_deref(), Some("Williamsburg"));
    let y = y.unwrap();
    assert_eq!(y.context.neighborhood.as_deref(), Some("Astoria"));
    assert_eq!(y.context.bedrooms, Some(0));
}

#[tokio::test]
async fn viewers_see_the_same_committed_snapshot() {
    let sessions = Arc::new(SharedSessionCache::default());
    let manager = manager(sessions.clone());

    manager
        .invoke("2 bed apartments in Williamsburg", "owner", None)
        .await
        .unwrap();
    let thread = manager.load_thread("owner").await.unwrap().unwrap();
    let share_id = sessions
        .create("owner", SessionSnapshot::from_thread(&thread))
        .unwrap();

    let mut first = sessions.join(&share_id).unwrap();
    let mut second = sessions.join(&share_id).unwrap();

    manager.invoke("under $3000", "owner", None).await.unwrap();

    let seen_first = first.changed().await.unwrap();
    let seen_second = second.changed().await.unwrap();

    assert!(Arc::ptr_eq(&seen_first.snapshot, &seen_second.snapshot));
    assert_eq!(seen_first.revision, seen_second.revision);
    assert_eq!(seen_first.snapshot.query_record.max_price, Some(3000));
    let ids: Vec<&str> = seen_first
        .snapshot
        .listings
        .iter()
        .map(|l| l.id.as_str())
        .collect();
    assert_eq!(ids, vec!["wb-101"]);
}
