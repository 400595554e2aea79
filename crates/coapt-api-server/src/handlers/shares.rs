use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::share::*;
use crate::services::share::{SessionSnapshot, SessionView, SharedSessionCache, VoteDirection, VoteTally};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// `POST /api/shares`: share a thread. Sharing it again returns the same id.
pub async fn create_share_handler(
    State(state): State<AppState>,
    payload: Result<Json<CreateShareRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateShareResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let thread_id = request
        .thread_id
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("threadId is required".to_string()))?;

    let seed = state
        .conversation_manager
        .load_thread(&thread_id)
        .await?
        .map(|thread| SessionSnapshot::from_thread(&thread))
        .unwrap_or_default();

    let share_id = state.sessions.create(&thread_id, seed)?;
    let url = format!(
        "{}/{}",
        state.settings.sharing.public_path.trim_end_matches('/'),
        share_id
    );

    info!("Thread {} shared as {}", thread_id, share_id);
    Ok((StatusCode::CREATED, Json(CreateShareResponse { share_id, url })))
}

/// `GET /api/shares/{shareId}`
pub async fn get_share_handler(
    State(sessions): State<Arc<SharedSessionCache>>,
    Path(share_id): Path<String>,
) -> Result<Json<Arc<SessionView>>, ApiError> {
    Ok(Json(sessions.get(&share_id)?))
}

/// `POST /api/shares/{shareId}/participation`: join or leave. Idempotent.
pub async fn participation_handler(
    State(sessions): State<Arc<SharedSessionCache>>,
    Path(share_id): Path<String>,
    payload: Result<Json<ParticipationRequest>, JsonRejection>,
) -> Result<Json<ParticipationResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let viewer_id = request
        .viewer_id
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let view = sessions.toggle_participation(&share_id, &viewer_id, request.enable)?;
    Ok(Json(ParticipationResponse {
        viewer_id,
        participating: request.enable,
        view: Some(view),
    }))
}

/// `GET /api/shares/{shareId}/events`: whole-view `snapshot` events until
/// the share expires or the client goes away.
pub async fn share_events_handler(
    State(sessions): State<Arc<SharedSessionCache>>,
    Path(share_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let viewer_id = query
        .viewer_id
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut handle = sessions.join_as(&share_id, &viewer_id)?;
    let guard = ViewerGuard {
        sessions: sessions.clone(),
        share_id: share_id.clone(),
        viewer_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;

        yield Ok(create_sse_event("snapshot", &*handle.current()));

        while let Some(view) = handle.changed().await {
            yield Ok(create_sse_event("snapshot", &*view));
        }

        yield Ok(create_sse_event("closed", &serde_json::json!({ "shareId": share_id })));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `POST /api/shares/{shareId}/votes`
pub async fn vote_handler(
    State(sessions): State<Arc<SharedSessionCache>>,
    Path(share_id): Path<String>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteTally>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let property_id = request
        .property_id
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("propertyId is required".to_string()))?;
    let direction = request
        .direction
        .as_deref()
        .and_then(VoteDirection::parse)
        .ok_or_else(|| {
            ApiError::BadRequest(r#"direction must be "up", "down", or "none""#.to_string())
        })?;
    let voter_id = request
        .voter_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("voterId is required".to_string()))?;

    let tally = sessions.vote(&share_id, &property_id, &voter_id, direction)?;
    debug!(
        "Vote on share {} property {}: {:?} -> {:?}",
        share_id, property_id, direction, tally
    );
    Ok(Json(tally))
}

/// `GET /api/shares/{shareId}/votes?sessionId=`: tallies per listing, plus
/// the caller's own vote when `sessionId` is given.
pub async fn votes_handler(
    State(sessions): State<Arc<SharedSessionCache>>,
    Path(share_id): Path<String>,
    Query(query): Query<VotesQuery>,
) -> Result<Json<VotesResponse>, ApiError> {
    let voter_id = query.session_id.filter(|v| !v.trim().is_empty());
    let votes = sessions.votes_for(&share_id, voter_id.as_deref())?;
    Ok(Json(VotesResponse { votes }))
}

/// Leaves the share when the event stream is dropped.
struct ViewerGuard {
    sessions: Arc<SharedSessionCache>,
    share_id: String,
    viewer_id: String,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if let Err(e) = self
            .sessions
            .toggle_participation(&self.share_id, &self.viewer_id, false)
        {
            debug!("Viewer {} left share {}: {}", self.viewer_id, self.share_id, e);
        }
    }
}

fn create_sse_event<T: serde::Serialize>(event_type: &str, data: &T) -> Event {
    Event::default()
        .event(event_type)
        .data(serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()))
}
