mod configuration;
mod error;
mod routes;
mod state;
mod tools;

use configuration::Settings;
use forge::agent::{Agent, NoTools, ToolExecutor};
use forge::memory::ConversationMemory;
use forge::providers::factory;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::new()?;

    let router = factory::build_router(&settings.ai)?;
    info!(providers = ?router.list_providers(), "model router ready");

    let tools: Arc<dyn ToolExecutor> = match &settings.tools.endpoint {
        Some(endpoint) => {
            info!("using tool service at {}", endpoint);
            Arc::new(tools::RemoteToolExecutor::new(endpoint.as_str())?)
        }
        None => Arc::new(NoTools),
    };

    let agent = Agent::new(
        Arc::new(router),
        Arc::new(ConversationMemory::new(settings.memory)),
        tools,
        settings.agent,
    );
    let state = state::AppState::new(agent);

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(settings.server.socket_addr()?).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
