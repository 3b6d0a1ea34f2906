use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct SessionSummary {
    session_id: String,
    message_count: usize,
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<SessionSummary> {
    let message_count = state.memory().message_count(&session_id);
    Json(SessionSummary {
        session_id,
        message_count,
    })
}

/// Forget a conversation. Clearing an unknown session is not an error.
async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.memory().clear(&session_id);
    StatusCode::NO_CONTENT
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/sessions/:session_id", get(get_session).delete(clear_session))
        .with_state(state)
}
