use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{
    ChunkStream, ModelRequest, ModelResponse, Provider, StreamChunk, ToolCallAnnouncement,
};
use super::configs::OllamaProviderConfig;
use super::utils::{
    handle_response, messages_to_openai_spec, openai_response_to_model_response,
    tools_to_openai_spec,
};
use crate::errors::{ForgeError, ForgeResult};

const NAME: &str = "ollama";
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);
const CATALOG_TIMEOUT: Duration = Duration::from_secs(3);

pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// One line of the native chat stream
#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<Value>,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> ForgeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()
            .map_err(|e| ForgeError::provider(NAME, e))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }

    fn model<'a>(&'a self, request: &'a ModelRequest) -> &'a str {
        request.model.as_deref().unwrap_or(&self.config.model)
    }

    async fn tags(&self, timeout: Duration) -> Option<TagsResponse> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }
}

/// Decode a newline-delimited JSON chat stream
fn decode_ndjson<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let stream = async_stream::stream! {
        let mut body = Box::pin(body);
        // Raw bytes until a full line is in, so split characters survive
        let mut buf: Vec<u8> = Vec::new();
        let mut finished = false;
        'read: while let Some(bytes) = body.next().await {
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(ForgeError::provider(NAME, format!("stream interrupted: {e}")));
                    return;
                }
            };
            buf.extend_from_slice(bytes.as_ref());
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                for item in decode_line(&String::from_utf8_lossy(&line)) {
                    let terminal = !matches!(&item, Ok(chunk) if !chunk.done);
                    yield item;
                    if terminal {
                        finished = true;
                        break 'read;
                    }
                }
            }
        }
        if !finished {
            for item in decode_line(&String::from_utf8_lossy(&buf)) {
                let terminal = !matches!(&item, Ok(chunk) if !chunk.done);
                yield item;
                if terminal {
                    return;
                }
            }
            yield Ok(StreamChunk::done());
        }
    };
    stream.boxed()
}

fn decode_line(line: &str) -> Vec<ForgeResult<StreamChunk>> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let parsed: ChatLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("skipping malformed chat line: {e}");
            return Vec::new();
        }
    };
    if let Some(error) = parsed.error {
        return vec![Err(ForgeError::provider(NAME, error))];
    }

    let mut items = Vec::new();
    let mut content = String::new();
    if let Some(message) = parsed.message {
        for call in &message.tool_calls {
            if let Some(name) = call["function"]["name"].as_str() {
                items.push(Ok(StreamChunk::tool_call(ToolCallAnnouncement {
                    id: None,
                    name: name.to_string(),
                })));
            }
        }
        content = message.content;
    }
    if !content.is_empty() || parsed.done {
        items.push(Ok(StreamChunk {
            content,
            tool_call: None,
            done: parsed.done,
        }));
    }
    items
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn complete(&self, request: &ModelRequest) -> ForgeResult<ModelResponse> {
        let mut payload = json!({
            "model": self.model(request),
            "messages": messages_to_openai_spec(&request.messages),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(&request.tools)?);
        }

        let response = self
            .client
            .post(self.url("/v1/chat/completions"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ForgeError::provider(NAME, e))?;
        let body: Value = handle_response(NAME, response)
            .await?
            .json()
            .await
            .map_err(|e| ForgeError::provider(NAME, e))?;

        Ok(openai_response_to_model_response(&body))
    }

    async fn stream_complete(&self, request: &ModelRequest) -> ForgeResult<ChunkStream> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let payload = json!({
            "model": self.model(request),
            "messages": messages,
            "stream": true,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ForgeError::provider(NAME, e))?;
        let response = handle_response(NAME, response).await?;

        Ok(decode_ndjson(response.bytes_stream()))
    }

    async fn available(&self) -> bool {
        self.tags(LIVENESS_TIMEOUT).await.is_some()
    }

    async fn models(&self) -> Vec<String> {
        let names: Vec<String> = self
            .tags(CATALOG_TIMEOUT)
            .await
            .map(|tags| tags.models.into_iter().map(|m| m.name).collect())
            .unwrap_or_default();
        if names.is_empty() {
            vec![self.config.model.clone()]
        } else {
            names
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(host: String) -> OllamaProvider {
        OllamaProvider::new(OllamaProviderConfig {
            host,
            model: "codestral".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_basic() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "codestral"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "codestral",
                "choices": [{
                    "message": {"role": "assistant", "content": "mvn -q test"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 8, "completion_tokens": 4}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let response = provider(mock_server.uri())
            .complete(&ModelRequest::new(vec![Message::user().with_text("How do I run tests?")]))
            .await?;
        assert_eq!(response.content, "mvn -q test");
        assert_eq!(response.usage.total(), 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_ndjson() -> anyhow::Result<()> {
        let body = [
            json!({"model": "codestral", "message": {"role": "assistant", "content": "Hel"}, "done": false}),
            json!({"model": "codestral", "message": {"role": "assistant", "content": "lo"}, "done": false}),
            json!({"model": "codestral", "message": {"role": "assistant", "content": ""}, "done": true}),
        ]
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\n");

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;

        let chunks: Vec<StreamChunk> = provider(mock_server.uri())
            .stream_complete(&ModelRequest::new(vec![Message::user().with_text("hi")]))
            .await?
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "Hel");
        assert_eq!(chunks[1].content, "lo");
        assert!(chunks[2].done);
        Ok(())
    }

    #[tokio::test]
    async fn test_ndjson_keeps_characters_split_across_reads() {
        let line = json!({"message": {"content": "naïve"}, "done": true}).to_string() + "\n";
        let bytes = line.into_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let body = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(bytes[..split].to_vec()),
            Ok(bytes[split..].to_vec()),
        ]);

        let chunks: Vec<StreamChunk> = decode_ndjson(body).map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "naïve");
        assert!(chunks[0].done);
    }

    #[tokio::test]
    async fn test_stream_without_done_line() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                json!({"message": {"content": "partial"}, "done": false}).to_string(),
            ))
            .mount(&mock_server)
            .await;

        let chunks: Vec<StreamChunk> = provider(mock_server.uri())
            .stream_complete(&ModelRequest::new(vec![Message::user().with_text("hi")]))
            .await?
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "partial");
        assert!(chunks[1].done);
        Ok(())
    }

    #[tokio::test]
    async fn test_tags_catalog() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "codestral:latest"}, {"name": "llama3.1:8b"}]
            })))
            .mount(&mock_server)
            .await;

        let provider = provider(mock_server.uri());
        assert!(provider.available().await);
        assert_eq!(provider.models().await, vec!["codestral:latest", "llama3.1:8b"]);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Nothing listens on the discard port
        let provider = provider("http://127.0.0.1:9".to_string());
        assert!(!provider.available().await);
        assert_eq!(provider.models().await, vec!["codestral"]);
    }
}
