use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{ForgeError, ForgeResult, ToolError, ToolResult};
use crate::memory::ConversationMemory;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolInfo, ToolInvocation, ToolOutcome};
use crate::prompt_template::load_prompt_file;
use crate::providers::base::ModelRequest;
use crate::router::Router;

pub const DEFAULT_INSTRUCTIONS: &str = "\
You are Forge, a secure AI developer agent for JVM teams.
You help developers with Spring Boot, Kafka and Gradle/Maven projects.

Guidelines:
- Be concise and helpful
- Use tools when needed to answer questions
- Always explain what you're doing
- Never expose secrets or credentials
- Prefer reading files over guessing";

/// Executes the tools a model asks for. Implemented outside the core.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> ToolResult<ToolOutcome>;

    async fn list_tools(&self) -> Vec<ToolInfo>;
}

/// An executor with an empty catalog
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    async fn execute(
        &self,
        name: &str,
        _input: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> ToolResult<ToolOutcome> {
        Err(ToolError::NotFound(name.to_string()))
    }

    async fn list_tools(&self) -> Vec<ToolInfo> {
        Vec::new()
    }
}

/// Receives progress of a turn, in order. A turn ends with either
/// `on_response` followed by `on_done`, or a single `on_error`.
pub trait Observer: Send + Sync {
    fn on_thinking(&self, _text: &str) {}
    fn on_response(&self, _text: &str) {}
    fn on_tool_call(&self, _name: &str, _input: &Map<String, Value>) {}
    fn on_tool_result(&self, _name: &str, _outcome: &ToolOutcome) {}
    fn on_error(&self, _error: &ForgeError) {}
    fn on_done(&self) {}
}

/// Ignores every notification
pub struct NullObserver;

impl Observer for NullObserver {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Thinking {
        text: String,
    },
    Response {
        text: String,
    },
    ToolCall {
        name: String,
        input: Map<String, Value>,
    },
    ToolResult {
        name: String,
        outcome: ToolOutcome,
    },
    Error {
        message: String,
        #[serde(skip)]
        error: ForgeError,
    },
    Done,
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done | AgentEvent::Error { .. })
    }
}

/// Forwards notifications into a channel as [`AgentEvent`]s. Events sent
/// after the receiver is gone are dropped.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn on_thinking(&self, text: &str) {
        self.send(AgentEvent::Thinking {
            text: text.to_string(),
        });
    }

    fn on_response(&self, text: &str) {
        self.send(AgentEvent::Response {
            text: text.to_string(),
        });
    }

    fn on_tool_call(&self, name: &str, input: &Map<String, Value>) {
        self.send(AgentEvent::ToolCall {
            name: name.to_string(),
            input: input.clone(),
        });
    }

    fn on_tool_result(&self, name: &str, outcome: &ToolOutcome) {
        self.send(AgentEvent::ToolResult {
            name: name.to_string(),
            outcome: outcome.clone(),
        });
    }

    fn on_error(&self, error: &ForgeError) {
        self.send(AgentEvent::Error {
            message: error.to_string(),
            error: error.clone(),
        });
    }

    fn on_done(&self) {
        self.send(AgentEvent::Done);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub instructions: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_tokens: 4096,
            temperature: 0.1,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

/// One user message and the context it arrived with
#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub session: String,
    pub message: String,
    /// Project path, consulted by routing policy
    pub project: Option<String>,
    /// Explicit `provider/model` override
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl Turn {
    pub fn new<S: Into<String>, M: Into<String>>(session: S, message: M) -> Self {
        Self {
            session: session.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_project<S: Into<String>>(mut self, project: S) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Serialize)]
struct PromptContext<'a> {
    instructions: &'a str,
    tools: &'a [ToolInfo],
}

/// Agent drives the model/tool loop for one user message at a time per
/// session
pub struct Agent {
    router: Arc<Router>,
    memory: Arc<ConversationMemory>,
    tools: Arc<dyn ToolExecutor>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        router: Arc<Router>,
        memory: Arc<ConversationMemory>,
        tools: Arc<dyn ToolExecutor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            router,
            memory,
            tools,
            config,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn system_prompt(&self, catalog: &[ToolInfo]) -> ForgeResult<String> {
        let context = PromptContext {
            instructions: &self.config.instructions,
            tools: catalog,
        };
        load_prompt_file("system.md", &context).map_err(|e| ForgeError::Template(e.to_string()))
    }

    fn build_request(&self, system: &str, tools: &[Tool], turn: &Turn) -> ModelRequest {
        let mut messages = vec![Message::system().with_text(system)];
        messages.extend(self.memory.get(&turn.session));

        let mut request = ModelRequest::new(messages)
            .with_tools(tools.to_vec())
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature);
        if let Some(model) = &turn.model {
            request = request.with_model(model);
        }
        if let Some(project) = &turn.project {
            request = request.with_project(project);
        }
        if let Some(dir) = &turn.working_dir {
            request = request.with_working_dir(dir);
        }
        request
    }

    async fn run_tool(
        &self,
        call: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> ForgeResult<ToolOutcome> {
        if let Some(error) = &call.error {
            return Ok(ToolOutcome::failed(error.clone()));
        }
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            result = self.tools.execute(&call.name, &call.input, cancel) => result,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(ToolError::Cancelled) => return Err(ForgeError::Cancelled),
            Err(e) => {
                tracing::warn!("tool {} failed: {}", call.name, e);
                ToolOutcome::failed(e.to_string())
            }
        };
        if outcome.duration.is_zero() {
            Ok(outcome.with_duration(started.elapsed()))
        } else {
            Ok(outcome)
        }
    }

    /// Answer invocations that will never run, so the stored history keeps
    /// every tool call paired with a result
    fn close_unanswered(&self, session: &str, calls: &[ToolInvocation]) {
        for call in calls {
            let outcome = ToolOutcome::failed("cancelled");
            self.memory
                .add(session, Message::tool(&call.id).with_text(outcome.as_context_text()));
        }
    }

    /// Process one user message through to a final answer.
    ///
    /// Every outcome is reported to the observer as well as returned:
    /// success as `on_response` then `on_done`, failure as `on_error`.
    /// Messages committed to memory before a failure are kept.
    pub async fn process_message(
        &self,
        turn: Turn,
        observer: &dyn Observer,
        cancel: &CancellationToken,
    ) -> ForgeResult<()> {
        let result = self.run_turn(&turn, observer, cancel).await;
        if let Err(error) = &result {
            tracing::debug!(session = %turn.session, "turn failed: {}", error);
            observer.on_error(error);
        }
        result
    }

    async fn run_turn(
        &self,
        turn: &Turn,
        observer: &dyn Observer,
        cancel: &CancellationToken,
    ) -> ForgeResult<()> {
        self.memory
            .add(&turn.session, Message::user().with_text(&turn.message));

        let catalog = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            catalog = self.tools.list_tools() => catalog,
        };
        let system = self.system_prompt(&catalog)?;
        let tools: Vec<Tool> = catalog.iter().map(Tool::from).collect();

        for _ in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(ForgeError::Cancelled);
            }
            observer.on_thinking("Thinking...");

            let request = self.build_request(&system, &tools, turn);
            let response = self.router.complete(&request, cancel).await?;

            if response.tool_calls.is_empty() {
                self.memory.add(&turn.session, response.to_message());
                observer.on_response(&response.content);
                observer.on_done();
                return Ok(());
            }

            self.memory.add(&turn.session, response.to_message());
            for (i, call) in response.tool_calls.iter().enumerate() {
                let outcome = if cancel.is_cancelled() {
                    Err(ForgeError::Cancelled)
                } else {
                    observer.on_tool_call(&call.name, &call.input);
                    self.run_tool(call, cancel).await
                };
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.close_unanswered(&turn.session, &response.tool_calls[i..]);
                        return Err(e);
                    }
                };
                observer.on_tool_result(&call.name, &outcome);
                self.memory.add(
                    &turn.session,
                    Message::tool(&call.id).with_text(outcome.as_context_text()),
                );
            }
        }

        Err(ForgeError::IterationBudgetExceeded(
            self.config.max_iterations,
        ))
    }
}
