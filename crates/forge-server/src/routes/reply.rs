use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use forge::agent::{AgentEvent, ChannelObserver, Turn};
use forge::models::message::Message;
use forge::providers::base::{ModelRequest, StreamChunk};
use futures::{stream::StreamExt, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    convert::Infallible,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// How often an idle stream checks whether the client is still there
const HEARTBEAT: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    session_id: String,
    message: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    prompt: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

// Custom SSE response type that implements the Vercel AI SDK protocol
pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> axum::response::Response {
        let body = axum::body::Body::from_stream(self);
        (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (header::CONNECTION, HeaderValue::from_static("keep-alive")),
                (
                    header::HeaderName::from_static("x-vercel-ai-data-stream"),
                    HeaderValue::from_static("v1"),
                ),
            ],
            body,
        )
            .into_response()
    }
}

// Protocol-specific message formatting
struct ProtocolFormatter;

impl ProtocolFormatter {
    fn format_text(text: &str) -> String {
        let encoded_text = serde_json::to_string(text).unwrap_or_else(|_| String::new());
        format!("0:{}\n", encoded_text)
    }

    fn format_tool_call(id: &str, name: &str, args: &Value) -> String {
        // Tool calls start with "9:"
        let tool_call = json!({
            "toolCallId": id,
            "toolName": name,
            "args": args
        });
        format!("9:{}\n", tool_call)
    }

    fn format_tool_response(id: &str, result: &str) -> String {
        // Tool responses start with "a:"
        let response = json!({
            "toolCallId": id,
            "result": result,
        });
        format!("a:{}\n", response)
    }

    fn format_error(message: &str) -> String {
        let encoded = serde_json::to_string(message).unwrap_or_else(|_| String::new());
        format!("3:{}\n", encoded)
    }

    fn format_finish(reason: &str) -> String {
        // Finish messages start with "d:"
        let finish = json!({
            "finishReason": reason,
            "usage": {
                "promptTokens": 0,
                "completionTokens": 0
            }
        });
        format!("d:{}\n", finish)
    }
}

/// Renders agent events as protocol lines. Tool calls run one at a time, so
/// each result belongs to the most recent call.
#[derive(Default)]
struct EventEncoder {
    calls: usize,
}

impl EventEncoder {
    fn current_call_id(&self) -> String {
        format!("call_{}", self.calls)
    }

    fn encode(&mut self, event: AgentEvent) -> Vec<String> {
        match event {
            AgentEvent::Thinking { .. } => Vec::new(),
            AgentEvent::Response { text } => text
                .split_inclusive('\n')
                .map(ProtocolFormatter::format_text)
                .collect(),
            AgentEvent::ToolCall { name, input } => {
                self.calls += 1;
                vec![ProtocolFormatter::format_tool_call(
                    &self.current_call_id(),
                    &name,
                    &Value::Object(input),
                )]
            }
            AgentEvent::ToolResult { outcome, .. } => vec![ProtocolFormatter::format_tool_response(
                &self.current_call_id(),
                &outcome.as_context_text(),
            )],
            AgentEvent::Error { message, .. } => vec![
                ProtocolFormatter::format_error(&message),
                ProtocolFormatter::format_finish("error"),
            ],
            AgentEvent::Done => vec![ProtocolFormatter::format_finish("stop")],
        }
    }
}

fn encode_chunk(chunk: &StreamChunk) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(call) = &chunk.tool_call {
        let id = call.id.clone().unwrap_or_default();
        lines.push(ProtocolFormatter::format_tool_call(&id, &call.name, &json!({})));
    }
    if !chunk.content.is_empty() {
        lines.push(ProtocolFormatter::format_text(&chunk.content));
    }
    if chunk.done {
        lines.push(ProtocolFormatter::format_finish("stop"));
    }
    lines
}

fn check_protocol(headers: &HeaderMap) -> Result<(), ApiError> {
    // Check protocol header (optional in our case)
    if let Some(protocol) = headers.get("x-protocol") {
        if protocol.to_str().map(|p| p != "data").unwrap_or(true) {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "unsupported protocol"));
        }
    }
    Ok(())
}

async fn send_all(tx: &mpsc::Sender<String>, lines: Vec<String>) -> bool {
    for line in lines {
        if tx.send(line).await.is_err() {
            return false;
        }
    }
    true
}

async fn reply_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReplyRequest>,
) -> Result<SseResponse, ApiError> {
    check_protocol(&headers)?;
    if request.session_id.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "session_id is required"));
    }
    let guard = state.sessions.try_acquire(&request.session_id).ok_or_else(|| {
        ApiError::new(
            StatusCode::CONFLICT,
            format!("session {} is already processing a message", request.session_id),
        )
    })?;

    let mut turn = Turn::new(request.session_id, request.message);
    turn.project = request.project;
    turn.model = request.model;
    turn.working_dir = request.working_dir;

    // Create channel for streaming
    let (tx, rx) = mpsc::channel(100);
    let stream = ReceiverStream::new(rx);

    tokio::spawn(async move {
        let _guard = guard;
        let cancel = CancellationToken::new();
        let (observer, mut events) = ChannelObserver::new();

        let agent = state.agent.clone();
        let turn_cancel = cancel.clone();
        let session = turn.session.clone();
        let running = tokio::spawn(async move {
            agent.process_message(turn, &observer, &turn_cancel).await
        });

        let mut encoder = EventEncoder::default();
        loop {
            match timeout(HEARTBEAT, events.recv()).await {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    if !send_all(&tx, encoder.encode(event)).await {
                        tracing::info!(session = %session, "client went away, cancelling turn");
                        cancel.cancel();
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                // Heartbeat, used to detect disconnected clients and stop the turn
                Err(_) => {
                    if tx.is_closed() {
                        tracing::info!(session = %session, "client went away, cancelling turn");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }

        // Keep the session guarded until the turn has really stopped
        if let Err(e) = running.await {
            tracing::error!("turn task failed: {}", e);
        }
    });

    Ok(SseResponse::new(stream))
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StreamRequest>,
) -> Result<SseResponse, ApiError> {
    check_protocol(&headers)?;

    let mut model_request = ModelRequest::new(vec![Message::user().with_text(&request.prompt)]);
    if let Some(project) = request.project {
        model_request = model_request.with_project(project);
    }
    if let Some(model) = request.model {
        model_request = model_request.with_model(model);
    }

    let cancel = CancellationToken::new();
    let mut chunks = state
        .router()
        .stream_complete(&model_request, &cancel)
        .await?;

    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        loop {
            match timeout(HEARTBEAT, chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    let done = chunk.done;
                    if !send_all(&tx, encode_chunk(&chunk)).await {
                        cancel.cancel();
                        break;
                    }
                    if done {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    let _ = send_all(
                        &tx,
                        vec![
                            ProtocolFormatter::format_error(&e.to_string()),
                            ProtocolFormatter::format_finish("error"),
                        ],
                    )
                    .await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    if tx.is_closed() {
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    });

    Ok(SseResponse::new(ReceiverStream::new(rx)))
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(reply_handler))
        .route("/stream", post(stream_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge::models::tool::ToolOutcome;
    use forge::providers::base::ToolCallAnnouncement;
    use serde_json::Map;

    #[test]
    fn test_format_text_escapes() {
        assert_eq!(
            ProtocolFormatter::format_text("say \"hi\"\n"),
            "0:\"say \\\"hi\\\"\\n\"\n"
        );
    }

    fn payload(line: &str, prefix: &str) -> Value {
        let body = line
            .strip_prefix(prefix)
            .and_then(|l| l.strip_suffix('\n'))
            .unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_encoder_pairs_results_with_calls() {
        let mut encoder = EventEncoder::default();
        assert!(encoder
            .encode(AgentEvent::Thinking {
                text: "Thinking...".into()
            })
            .is_empty());

        let call = encoder.encode(AgentEvent::ToolCall {
            name: "git_status".into(),
            input: Map::new(),
        });
        assert_eq!(
            payload(&call[0], "9:"),
            json!({"toolCallId": "call_1", "toolName": "git_status", "args": {}})
        );

        let result = encoder.encode(AgentEvent::ToolResult {
            name: "git_status".into(),
            outcome: ToolOutcome::success("clean"),
        });
        assert_eq!(
            payload(&result[0], "a:"),
            json!({"toolCallId": "call_1", "result": "clean"})
        );

        let response = encoder.encode(AgentEvent::Response {
            text: "line one\nline two".into(),
        });
        assert_eq!(response, vec!["0:\"line one\\n\"\n", "0:\"line two\"\n"]);
    }

    #[test]
    fn test_encoder_error_finishes_stream() {
        let mut encoder = EventEncoder::default();
        let lines = encoder.encode(AgentEvent::Error {
            message: "Operation cancelled".into(),
            error: forge::errors::ForgeError::Cancelled,
        });
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "3:\"Operation cancelled\"\n");
        assert_eq!(payload(&lines[1], "d:")["finishReason"], "error");
    }

    #[test]
    fn test_encode_chunk() {
        let lines = encode_chunk(&StreamChunk::tool_call(ToolCallAnnouncement {
            id: Some("toolu_1".into()),
            name: "git_log".into(),
        }));
        assert_eq!(lines.len(), 1);
        assert_eq!(
            payload(&lines[0], "9:"),
            json!({"toolCallId": "toolu_1", "toolName": "git_log", "args": {}})
        );
        assert_eq!(encode_chunk(&StreamChunk::text("hi")), vec!["0:\"hi\"\n"]);
        assert!(encode_chunk(&StreamChunk::done())[0].starts_with("d:"));
    }
}
