use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::ForgeResult;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolInvocation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A completion request as handed to the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Explicit `provider/model` override. Once the router has resolved a
    /// provider this holds only the provider-local model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Project path used for policy resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.1,
            model: None,
            working_dir: None,
            project: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_project<S: Into<String>>(mut self, project: S) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
}

impl ModelResponse {
    pub fn text<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            finish_reason: "stop".to_string(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolInvocation) -> Self {
        self.tool_calls.push(call);
        self.finish_reason = "tool_use".to_string();
        self
    }

    /// The assistant message this response becomes in conversation history
    pub fn to_message(&self) -> Message {
        Message::assistant()
            .with_text(&self.content)
            .with_tool_calls(self.tool_calls.iter().cloned())
    }
}

/// A tool call announced mid-stream. Input may not be known yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallAnnouncement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

/// One normalized increment of a streamed response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallAnnouncement>,
    pub done: bool,
}

impl StreamChunk {
    pub fn text<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn tool_call(announcement: ToolCallAnnouncement) -> Self {
        Self {
            tool_call: Some(announcement),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }
}

pub type ChunkStream = BoxStream<'static, ForgeResult<StreamChunk>>;

/// Base trait for AI providers (Anthropic, OpenAI, Ollama)
#[async_trait]
pub trait Provider: Send + Sync {
    /// The registry name, also the `provider` half of `provider/model`
    fn name(&self) -> &str;

    /// Generate the next assistant turn
    async fn complete(&self, request: &ModelRequest) -> ForgeResult<ModelResponse>;

    /// Generate the next assistant turn incrementally. The stream always ends
    /// with a chunk whose `done` flag is set.
    async fn stream_complete(&self, request: &ModelRequest) -> ForgeResult<ChunkStream>;

    /// Whether this provider can currently take requests
    async fn available(&self) -> bool;

    /// Live model catalog
    async fn models(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_usage_total() {
        let usage = Usage::new(10, 20);
        assert_eq!(usage.total(), 30);
    }

    #[test]
    fn test_usage_serialization() -> anyhow::Result<()> {
        let usage = Usage::new(10, 20);
        let json_value = serde_json::to_value(usage)?;
        assert_eq!(json_value["input_tokens"], json!(10));
        assert_eq!(json_value["output_tokens"], json!(20));
        Ok(())
    }

    #[test]
    fn test_response_to_message() {
        let response = ModelResponse::text("Running git status")
            .with_tool_call(ToolInvocation::new("toolu_1", "git_status", Map::new()));
        assert_eq!(response.finish_reason, "tool_use");

        let message = response.to_message();
        assert_eq!(message.content, "Running git status");
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "toolu_1");
    }

    #[test]
    fn test_request_defaults() {
        let request = ModelRequest::new(vec![Message::user().with_text("hi")]);
        assert_eq!(request.max_tokens, 4096);
        assert!(request.model.is_none());
        assert!(request.project.is_none());
    }
}
