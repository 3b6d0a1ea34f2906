use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{ChunkStream, ModelRequest, ModelResponse, Provider, StreamChunk, Usage};
use super::configs::{AnthropicAuth, AnthropicProviderConfig};
use super::stream::{decode_native, decode_relay, decode_sse, SseFrame};
use super::utils::handle_response;
use crate::errors::{ForgeError, ForgeResult};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolInvocation};

const NAME: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
/// Static keys with this prefix are OAuth access tokens
const OAUTH_KEY_PREFIX: &str = "sk-ant-oat";

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> ForgeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()
            .map_err(|e| ForgeError::provider(NAME, e))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }

    /// Attach version and credentials. A relay authenticates on its own,
    /// so nothing is sent to it.
    async fn authorize(&self, builder: RequestBuilder) -> ForgeResult<RequestBuilder> {
        let builder = builder.header("anthropic-version", API_VERSION);
        if self.config.relay {
            return Ok(builder);
        }
        Ok(match &self.config.auth {
            AnthropicAuth::ApiKey(key) if key.starts_with(OAUTH_KEY_PREFIX) => {
                builder.bearer_auth(key)
            }
            AnthropicAuth::ApiKey(key) => builder.header("x-api-key", key),
            AnthropicAuth::OAuth(store) => builder.bearer_auth(store.access_token().await?),
        })
    }

    fn build_payload(&self, request: &ModelRequest, stream: bool) -> Value {
        let (system, messages) = messages_to_anthropic_spec(&request.messages);
        let model = request.model.as_deref().unwrap_or(&self.config.model);

        let mut payload = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_anthropic_spec(&request.tools));
        }
        if stream {
            payload["stream"] = json!(true);
        }
        if self.config.relay {
            if let Some(dir) = &request.working_dir {
                payload["cwd"] = json!(dir.display().to_string());
            }
        }
        payload
    }

    async fn post(&self, payload: &Value) -> ForgeResult<reqwest::Response> {
        let builder = self.client.post(self.url("/v1/messages")).json(payload);
        let response = self
            .authorize(builder)
            .await?
            .send()
            .await
            .map_err(|e| ForgeError::provider(NAME, e))?;
        handle_response(NAME, response).await
    }
}

/// Split out the system prompt and convert the rest to the vendor's block
/// format. Consecutive tool results fold into a single user turn, since the
/// vendor requires user and assistant turns to alternate.
fn messages_to_anthropic_spec(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<&str> = Vec::new();
    let mut spec: Vec<Value> = Vec::new();
    let mut last_was_tool_result = false;

    for message in messages {
        match message.role {
            Role::System => {
                system.push(&message.content);
                continue;
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.as_deref().unwrap_or_default(),
                    "content": message.content,
                });
                if last_was_tool_result {
                    if let Some(blocks) = spec
                        .last_mut()
                        .and_then(|previous| previous["content"].as_array_mut())
                    {
                        blocks.push(block);
                    }
                } else {
                    spec.push(json!({"role": "user", "content": [block]}));
                }
                last_was_tool_result = true;
                continue;
            }
            Role::Assistant if message.has_tool_calls() => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": message.content}));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.input,
                    }));
                }
                spec.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::User | Role::Assistant => {
                spec.push(json!({
                    "role": message.role.as_str(),
                    "content": [{"type": "text", "text": message.content}],
                }));
            }
        }
        last_was_tool_result = false;
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, spec)
}

fn tools_to_anthropic_spec(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect()
}

fn to_model_response(raw: AnthropicResponse) -> ModelResponse {
    let mut response = ModelResponse {
        model: raw.model,
        usage: Usage::new(raw.usage.input_tokens, raw.usage.output_tokens),
        finish_reason: raw.stop_reason.unwrap_or_default(),
        ..Default::default()
    };
    for block in raw.content {
        match block {
            ContentBlock::Text { text } => response.content.push_str(&text),
            ContentBlock::ToolUse { id, name, input } => response
                .tool_calls
                .push(ToolInvocation::from_value(id, name, input)),
            ContentBlock::Other => {}
        }
    }
    response
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn complete(&self, request: &ModelRequest) -> ForgeResult<ModelResponse> {
        let payload = self.build_payload(request, false);
        let raw: AnthropicResponse = self
            .post(&payload)
            .await?
            .json()
            .await
            .map_err(|e| ForgeError::provider(NAME, format!("decoding response: {}", e)))?;
        Ok(to_model_response(raw))
    }

    async fn stream_complete(&self, request: &ModelRequest) -> ForgeResult<ChunkStream> {
        let payload = self.build_payload(request, true);
        let response = self.post(&payload).await?;

        let decode: fn(&SseFrame) -> Option<ForgeResult<StreamChunk>> = if self.config.relay {
            decode_relay
        } else {
            decode_native
        };
        Ok(decode_sse(NAME, response.bytes_stream(), decode))
    }

    async fn available(&self) -> bool {
        if self.config.relay {
            return true;
        }
        match &self.config.auth {
            AnthropicAuth::ApiKey(key) => !key.is_empty(),
            AnthropicAuth::OAuth(store) => store.has_token().await,
        }
    }

    async fn models(&self) -> Vec<String> {
        let fallback = vec![self.config.model.clone()];
        let builder = self
            .client
            .get(self.url("/v1/models?limit=100"))
            .timeout(Duration::from_secs(15));
        let builder = match self.authorize(builder).await {
            Ok(builder) => builder,
            Err(e) => {
                tracing::debug!("model catalog unavailable: {e}");
                return fallback;
            }
        };

        let list: ModelList = match builder.send().await {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(list) => list,
                Err(_) => return fallback,
            },
            _ => return fallback,
        };
        let names: Vec<String> = list.data.into_iter().map(|m| m.id).collect();
        if names.is_empty() {
            fallback
        } else {
            names
        }
    }
}
