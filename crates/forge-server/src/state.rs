use forge::agent::Agent;
use forge::memory::ConversationMemory;
use forge::router::Router;
use forge::session::SessionGuards;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub sessions: Arc<SessionGuards>,
}

impl AppState {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent: Arc::new(agent),
            sessions: Arc::new(SessionGuards::new()),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        self.agent.router()
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        self.agent.memory()
    }
}
