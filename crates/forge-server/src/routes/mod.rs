// Export route modules
pub mod models;
pub mod reply;
pub mod session;

use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "providers": state.router().list_providers(),
        "default_model": state.router().default_model(),
    }))
}

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state.clone())
        .merge(reply::routes(state.clone()))
        .merge(models::routes(state.clone()))
        .merge(session::routes(state))
}
