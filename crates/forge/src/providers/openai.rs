use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{
    ChunkStream, ModelRequest, ModelResponse, Provider, StreamChunk, ToolCallAnnouncement,
};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_openai_context_length_error, handle_response, messages_to_openai_spec,
    openai_response_to_model_response, tools_to_openai_spec,
};
use crate::errors::{ForgeError, ForgeResult};

const NAME: &str = "openai";

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> ForgeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()
            .map_err(|e| ForgeError::provider(NAME, e))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }

    async fn post(&self, payload: Value) -> ForgeResult<Value> {
        let response = self
            .client
            .post(self.url("/v1/chat/completions"))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ForgeError::provider(NAME, e))?;

        handle_response(NAME, response)
            .await?
            .json()
            .await
            .map_err(|e| ForgeError::provider(NAME, e))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn complete(&self, request: &ModelRequest) -> ForgeResult<ModelResponse> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let mut payload = json!({
            "model": model,
            "messages": messages_to_openai_spec(&request.messages),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(&request.tools)?);
        }

        let response = self.post(payload).await?;

        // Raise specific error if context length is exceeded
        if let Some(error) = response.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err);
            }
            return Err(ForgeError::provider(NAME, format!("API error: {}", error)));
        }
        if response["choices"].as_array().map_or(true, |c| c.is_empty()) {
            return Err(ForgeError::provider(NAME, "returned no choices"));
        }

        Ok(openai_response_to_model_response(&response))
    }

    /// Not streamed: the full completion arrives as one terminal chunk,
    /// preceded by an announcement per tool call
    async fn stream_complete(&self, request: &ModelRequest) -> ForgeResult<ChunkStream> {
        let response = self.complete(request).await?;

        let mut chunks: Vec<ForgeResult<StreamChunk>> = response
            .tool_calls
            .iter()
            .map(|call| {
                Ok(StreamChunk::tool_call(ToolCallAnnouncement {
                    id: Some(call.id.clone()),
                    name: call.name.clone(),
                }))
            })
            .collect();
        chunks.push(Ok(StreamChunk {
            content: response.content,
            tool_call: None,
            done: true,
        }));
        Ok(stream::iter(chunks).boxed())
    }

    async fn available(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    async fn models(&self) -> Vec<String> {
        let fallback = vec![self.config.model.clone()];
        if self.config.api_key.is_empty() {
            return fallback;
        }

        let response = self
            .client
            .get(self.url("/v1/models"))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        let body: Value = match response {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(body) => body,
                Err(_) => return fallback,
            },
            _ => return fallback,
        };

        let names: Vec<String> = body["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if names.is_empty() {
            fallback
        } else {
            names
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::models::tool::Tool;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup_mock_server(response_body: Value) -> (MockServer, OpenAiProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test_api_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;

        let config = OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gpt-4o".to_string(),
        };

        let provider = OpenAiProvider::new(config).unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_complete_basic() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I assist you today?",
                    "tool_calls": null
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 12,
                "completion_tokens": 15,
                "total_tokens": 27
            }
        });

        let (_, provider) = setup_mock_server(response_body).await;
        let request = ModelRequest::new(vec![Message::user().with_text("Hello?")]);

        let response = provider.complete(&request).await?;

        assert_eq!(response.content, "Hello! How can I assist you today?");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 15);
        assert_eq!(response.usage.total(), 27);
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_tool_request_streams_as_one_chunk() -> anyhow::Result<()> {
        let response_body = json!({
            "id": "chatcmpl-tool",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {
                            "name": "list_pipelines",
                            "arguments": "{\"project\":\"payments\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 15}
        });

        let (_, provider) = setup_mock_server(response_body).await;
        let tool = Tool::new(
            "list_pipelines",
            "Lists CI pipelines",
            json!({"type": "object", "properties": {"project": {"type": "string"}}}),
        );
        let request = ModelRequest::new(vec![Message::user().with_text("Any failing builds?")])
            .with_tools(vec![tool]);

        let chunks: Vec<_> = provider.stream_complete(&request).await?.collect().await;
        assert_eq!(chunks.len(), 2);
        let announcement = chunks[0].as_ref().unwrap().tool_call.clone().unwrap();
        assert_eq!(announcement.name, "list_pipelines");
        assert_eq!(announcement.id.as_deref(), Some("call_123"));
        assert!(chunks[1].as_ref().unwrap().done);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_error_is_provider_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;
        let provider = OpenAiProvider::new(OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "k".into(),
            model: "gpt-4o".into(),
        })
        .unwrap();

        let err = provider
            .complete(&ModelRequest::new(vec![Message::user().with_text("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ForgeError::Provider { ref message, .. } if message.contains("Server error")
        ));
    }

    #[tokio::test]
    async fn test_models_and_availability() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]
            })))
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "k".into(),
            model: "gpt-4o".into(),
        })
        .unwrap();
        assert!(provider.available().await);
        assert_eq!(provider.models().await, vec!["gpt-4o", "gpt-4o-mini"]);

        let keyless = OpenAiProvider::new(OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: String::new(),
            model: "gpt-4o".into(),
        })
        .unwrap();
        assert!(!keyless.available().await);
        assert_eq!(keyless.models().await, vec!["gpt-4o"]);
    }
}
