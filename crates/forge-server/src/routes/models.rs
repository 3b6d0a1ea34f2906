use crate::error::ApiError;
use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use forge::router::ModelInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct DefaultModel {
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetDefaultModelRequest {
    model: String,
}

/// Live catalog across every registered provider
async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    Json(state.router().list_models().await)
}

async fn get_default_model(State(state): State<AppState>) -> Json<DefaultModel> {
    Json(DefaultModel {
        model: state.router().default_model(),
    })
}

async fn set_default_model(
    State(state): State<AppState>,
    Json(request): Json<SetDefaultModelRequest>,
) -> Result<Json<DefaultModel>, ApiError> {
    state.router().set_default_model(&request.model)?;
    tracing::info!("default model set to {}", request.model);
    Ok(Json(DefaultModel {
        model: Some(request.model),
    }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route(
            "/models/default",
            get(get_default_model).put(set_default_model),
        )
        .with_state(state)
}
