use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use coapt_api_server::build_router;
use coapt_api_server::config::Settings;
use coapt_api_server::database::models::{BuildingUnit, ListingSummary, PricePoint};
use coapt_api_server::logging::ActivityLogger;
use coapt_api_server::services::context::SearchContext;
use coapt_api_server::services::gateway::ListingPage;
use coapt_api_server::services::conversation::{build_pipeline, ConversationManager, InMemoryThreadStore};
use coapt_api_server::services::{
    NeighborhoodDirectory, RuleBasedExtractor, SearchGateway, SharedSessionCache, StaticGateway,
};
use coapt_api_server::state::AppState;
use coapt_api_server::utils::limiters::Limiters;

fn app_parts(gateway: Arc<dyn SearchGateway>) -> (Router, Arc<ConversationManager>) {
    let limiters = Arc::new(Limiters::default());
    let directory = Arc::new(NeighborhoodDirectory::builtin());
    let sessions = Arc::new(SharedSessionCache::default());
    let pipeline = build_pipeline(
        Arc::new(RuleBasedExtractor::new(directory.clone())),
        directory,
        gateway.clone(),
        limiters.clone(),
        2,
        20,
    );
    let manager = ConversationManager::new(
        Arc::new(InMemoryThreadStore::default()),
        pipeline,
        ActivityLogger::disabled(),
    )
    .with_sessions(sessions.clone());
    let manager = Arc::new(manager);

    let router = build_router(AppState {
        settings: Arc::new(Settings::default()),
        db_pool: None,
        gateway,
        conversation_manager: manager.clone(),
        sessions,
        limiters,
    });
    (router, manager)
}

fn app_with(gateway: Arc<dyn SearchGateway>) -> Router {
    app_parts(gateway).0
}

fn app() -> Router {
    app_with(Arc::new(StaticGateway::sample()))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

struct BrokenGateway;

#[async_trait]
impl SearchGateway for BrokenGateway {
    async fn price_history(&self, _property_id: &str) -> Result<Vec<PricePoint>> {
        anyhow::bail!("relation \"price_history\" does not exist")
    }

    async fn building_units(&self, _property_id: &str) -> Result<Vec<BuildingUnit>> {
        anyhow::bail!("connection reset")
    }

    async fn search_listings(&self, _filters: &SearchContext, _page: ListingPage) -> Result<Vec<ListingSummary>> {
        anyhow::bail!("connection reset")
    }

    async fn count_listings(&self, _filters: &SearchContext) -> Result<u64> {
        anyhow::bail!("connection reset")
    }

    async fn neighborhoods(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Sample data behind a slow search, so a request can be dropped mid-turn.
struct SlowGateway {
    inner: StaticGateway,
    delay: Duration,
}

#[async_trait]
impl SearchGateway for SlowGateway {
    async fn price_history(&self, property_id: &str) -> Result<Vec<PricePoint>> {
        self.inner.price_history(property_id).await
    }

    async fn building_units(&self, property_id: &str) -> Result<Vec<BuildingUnit>> {
        self.inner.building_units(property_id).await
    }

    async fn search_listings(&self, filters: &SearchContext, page: ListingPage) -> Result<Vec<ListingSummary>> {
        tokio::time::sleep(self.delay).await;
        self.inner.search_listings(filters, page).await
    }

    async fn count_listings(&self, filters: &SearchContext) -> Result<u64> {
        self.inner.count_listings(filters).await
    }

    async fn neighborhoods(&self) -> Result<Vec<String>> {
        self.inner.neighborhoods().await
    }
}

fn listing_ids(listings: &Value) -> Vec<&str> {
    listings
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["id"].as_str().unwrap())
        .collect()
}

#[tokio::test]
async fn health_endpoints_respond() {
    let app = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = send(&app, "GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn chat_requires_message_and_thread() {
    let app = app();

    let (status, body) = send(&app, "POST", "/api/chat", Some(json!({"threadId": "t1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Message is required"}));

    let (status, body) = send(&app, "POST", "/api/chat", Some(json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Thread ID is required"}));

    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": 42, "threadId": "t1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Message is required"}));
}

#[tokio::test]
async fn chat_rejects_invalid_existing_context() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({
            "message": "under $3000",
            "threadId": "t1",
            "existingContext": {"bedrooms": "two"}
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid existingContext"));
}

#[tokio::test]
async fn chat_refines_search_across_turns() {
    let app = app();

    let (status, first) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({
            "message": "show me 2 bed apartments in Williamsburg",
            "threadId": "t1",
            "existingContext": {}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["context"], json!({"neighborhood": "Williamsburg", "bedrooms": 2}));
    assert!(first["reply"].is_string());
    assert!(first["listings"].is_array());

    let (status, second) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({
            "message": "under $3000",
            "threadId": "t1",
            "existingContext": first["context"].clone()
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        second["context"],
        json!({"neighborhood": "Williamsburg", "bedrooms": 2, "maxPrice": 3000})
    );
    assert_eq!(listing_ids(&second["listings"]), vec!["wb-101"]);
}

#[tokio::test]
async fn chat_null_in_existing_context_clears_filter() {
    let app = app();
    send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "show me 2 bed apartments in Williamsburg", "threadId": "t1"})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({
            "message": "under $3000",
            "threadId": "t1",
            "existingContext": {"bedrooms": 2, "neighborhood": null}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["context"], json!({"bedrooms": 2, "maxPrice": 3000}));
    assert_eq!(listing_ids(&body["listings"]), vec!["bw-301", "wb-101"]);
}

#[tokio::test]
async fn chat_sort_orders_listings() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({
            "message": "apartments in Williamsburg",
            "threadId": "t1",
            "sort": "newest"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        listing_ids(&body["listings"]),
        vec!["wb-101", "wb-103", "wb-201", "wb-102"]
    );
}

#[tokio::test]
async fn chat_turn_commits_after_client_disconnects() {
    let (app, manager) = app_parts(Arc::new(SlowGateway {
        inner: StaticGateway::sample(),
        delay: Duration::from_millis(200),
    }));

    let request = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"message": "2 bed apartments in Williamsburg", "threadId": "gone"}).to_string(),
        ))
        .unwrap();
    let dropped = tokio::time::timeout(Duration::from_millis(50), app.clone().oneshot(request)).await;
    assert!(dropped.is_err(), "request should still be in flight");

    let mut committed = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if let Some(thread) = manager.load_thread("gone").await.unwrap() {
            if thread.history.len() == 2 {
                committed = Some(thread);
                break;
            }
        }
    }

    let thread = committed.expect("turn was not committed");
    assert_eq!(thread.context.bedrooms, Some(2));
    assert_eq!(thread.context.neighborhood.as_deref(), Some("Williamsburg"));
    assert_eq!(thread.history[0].message, "2 bed apartments in Williamsburg");
}

#[tokio::test]
async fn search_runs_structured_filters() {
    let app = app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/search",
        Some(json!({
            "filters": {"borough": "Brooklyn"},
            "sort": "most_expensive",
            "limit": 2
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing_ids(&body["results"]), vec!["wb-201", "wb-102"]);
    assert_eq!(body["resultCount"], 5);

    let (_, body) = send(
        &app,
        "POST",
        "/api/search",
        Some(json!({"filters": {"borough": "Brooklyn"}, "offset": 4})),
    )
    .await;
    assert_eq!(listing_ids(&body["results"]), vec!["wb-201"]);
    assert_eq!(body["resultCount"], 5);

    let (status, body) = send(&app, "POST", "/api/search", Some(json!({"filters": {}}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"results": [], "resultCount": 0}));
}

#[tokio::test]
async fn search_validates_and_hides_backend_errors() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/search", Some(json!({"sort": "newest"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Filters object is required"}));

    let (status, body) = send(
        &app,
        "POST",
        "/api/search",
        Some(json!({"filters": {"minPrice": 5000, "maxPrice": 1000}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid filters"));

    let broken = app_with(Arc::new(BrokenGateway));
    let (status, body) = send(
        &broken,
        "POST",
        "/api/search",
        Some(json!({"filters": {"bedrooms": 2}})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "Failed to execute search"}));
}

#[tokio::test]
async fn chat_failure_returns_details() {
    let app = app_with(Arc::new(BrokenGateway));
    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "2 bed in Williamsburg", "threadId": "t1"})),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to process chat message");
    assert!(body["details"].as_str().unwrap().contains("execute_search"));
    assert_eq!(body["partialContext"]["bedrooms"], 2);
}

#[tokio::test]
async fn price_history_is_ascending_with_nulls() {
    let app = app();

    let (status, body) = send(&app, "GET", "/api/properties/uws-401/price-history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"date": "2025-06-01", "price": 5600.0},
            {"date": "2025-07-01", "price": null},
            {"date": "2025-08-01", "price": 5200.0}
        ])
    );

    let (status, body) = send(&app, "GET", "/api/properties/nope/price-history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn building_units_exclude_the_queried_unit() {
    let app = app();

    let (status, body) = send(&app, "GET", "/api/properties/wb-101/building-units", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["wb-103", "wb-102"]);

    let (_, body) = send(&app, "GET", "/api/properties/wb-201/building-units", None).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn property_reads_hide_backend_errors() {
    let app = app_with(Arc::new(BrokenGateway));

    let (status, body) = send(&app, "GET", "/api/properties/wb-101/price-history", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "Failed to fetch price history"}));

    let (status, body) = send(&app, "GET", "/api/properties/wb-101/building-units", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "Failed to fetch building units"}));
}

#[tokio::test]
async fn share_lifecycle() {
    let app = app();
    send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "2 bed apartments in Williamsburg", "threadId": "t1"})),
    )
    .await;

    let (status, created) = send(&app, "POST", "/api/shares", Some(json!({"threadId": "t1"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let share_id = created["shareId"].as_str().unwrap().to_string();
    assert_eq!(share_id.len(), 22);
    assert_eq!(created["url"], format!("/s/{}", share_id));

    let (_, again) = send(&app, "POST", "/api/shares", Some(json!({"threadId": "t1"}))).await;
    assert_eq!(again["shareId"], share_id.as_str());

    let (status, view) = send(&app, "GET", &format!("/api/shares/{}", share_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["snapshot"]["queryRecord"]["bedrooms"], 2);
    assert_eq!(view["snapshot"]["chatHistory"].as_array().unwrap().len(), 2);

    let uri = format!("/api/shares/{}/participation", share_id);
    let (status, joined) = send(&app, "POST", &uri, Some(json!({"viewerId": "v1", "enable": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["participating"], true);
    assert_eq!(joined["view"]["viewerCount"], 1);

    let (_, rejoined) = send(&app, "POST", &uri, Some(json!({"viewerId": "v1", "enable": true}))).await;
    assert_eq!(rejoined["view"]["viewerCount"], 1);

    let (_, left) = send(&app, "POST", &uri, Some(json!({"viewerId": "v1", "enable": false}))).await;
    assert_eq!(left["participating"], false);
    assert_eq!(left["view"]["viewerCount"], 0);
}

#[tokio::test]
async fn share_requests_validate_input() {
    let app = app();

    let (status, body) = send(&app, "POST", "/api/shares", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "threadId is required"}));

    let (status, body) = send(&app, "GET", "/api/shares/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Share not found or expired"}));

    let (status, _) = send(
        &app,
        "POST",
        "/api/shares/unknown/participation",
        Some(json!({"enable": true})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn votes_follow_toggle_rules() {
    let app = app();
    send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "2 bed apartments in Williamsburg", "threadId": "t1"})),
    )
    .await;
    let (_, created) = send(&app, "POST", "/api/shares", Some(json!({"threadId": "t1"}))).await;
    let uri = format!("/api/shares/{}/votes", created["shareId"].as_str().unwrap());

    let (status, body) = send(&app, "POST", &uri, Some(json!({"direction": "up", "voterId": "s1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "propertyId is required"}));

    let (_, body) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"propertyId": "wb-101", "direction": "sideways", "voterId": "s1"})),
    )
    .await;
    assert_eq!(body, json!({"error": "direction must be \"up\", \"down\", or \"none\""}));

    let (_, body) = send(&app, "POST", &uri, Some(json!({"propertyId": "wb-101", "direction": "up"}))).await;
    assert_eq!(body, json!({"error": "voterId is required"}));

    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"propertyId": "wb-101", "direction": "up", "voterId": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"upvotes": 1, "downvotes": 0}));

    let (_, body) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"propertyId": "wb-101", "direction": "down", "voterId": "s1"})),
    )
    .await;
    assert_eq!(body, json!({"upvotes": 0, "downvotes": 1}));

    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"propertyId": "ast-501", "direction": "up", "voterId": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Property not in this share"}));

    let (status, body) = send(&app, "GET", &format!("{}?sessionId=s1", uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"votes": {"wb-101": {"upvotes": 0, "downvotes": 1, "userVote": "down"}}})
    );

    let (_, body) = send(&app, "GET", &format!("{}?sessionId=s2", uri), None).await;
    assert_eq!(body["votes"]["wb-101"]["userVote"], Value::Null);

    let (status, _) = send(&app, "GET", "/api/shares/missing/votes", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn share_events_start_with_a_snapshot() {
    let app = app();
    let (_, created) = send(&app, "POST", "/api/shares", Some(json!({"threadId": "t9"}))).await;
    let share_id = created["shareId"].as_str().unwrap();

    let request = Request::builder()
        .uri(format!("/api/shares/{}/events?viewerId=v1", share_id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.starts_with("event: snapshot"));
    assert!(text.contains(share_id));
}

#[tokio::test]
async fn unknown_share_events_are_not_found() {
    let app = app();
    let (status, _) = send(&app, "GET", "/api/shares/missing/events", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
