use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    let api_routes = Router::new()
        .route("/api/chat", post(handlers::chat::chat_handler))
        .route("/api/search", post(handlers::search::search_handler))
        .route(
            "/api/properties/{id}/price-history",
            get(handlers::properties::price_history_handler),
        )
        .route(
            "/api/properties/{id}/building-units",
            get(handlers::properties::building_units_handler),
        )
        .route("/api/shares", post(handlers::shares::create_share_handler))
        .route("/api/shares/{share_id}", get(handlers::shares::get_share_handler))
        .route(
            "/api/shares/{share_id}/participation",
            post(handlers::shares::participation_handler),
        )
        .route(
            "/api/shares/{share_id}/events",
            get(handlers::shares::share_events_handler),
        )
        .route(
            "/api/shares/{share_id}/votes",
            get(handlers::shares::votes_handler).post(handlers::shares::vote_handler),
        );

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .with_state(state)
        // CORS
        .layer(CorsLayer::permissive())
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
}
