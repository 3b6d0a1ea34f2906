use async_trait::async_trait;
use forge::agent::ToolExecutor;
use forge::errors::{ToolError, ToolResult};
use forge::models::tool::{ToolInfo, ToolOutcome};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tool runs may build whole projects
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(600);
const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    name: &'a str,
    input: &'a Map<String, Value>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Runs tools through an HTTP tool service:
/// `GET {endpoint}/tools` and `POST {endpoint}/execute`
pub struct RemoteToolExecutor {
    client: Client,
    endpoint: String,
}

impl RemoteToolExecutor {
    pub fn new<S: Into<String>>(endpoint: S) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(EXECUTE_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, name: &str, input: &Map<String, Value>) -> ToolResult<ToolOutcome> {
        let response = self
            .client
            .post(format!("{}/execute", self.endpoint))
            .json(&ExecuteRequest { name, input })
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("tool service unreachable: {}", e)))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(ToolError::NotFound(name.to_string())),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                return Err(ToolError::InvalidParameters(body));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(ToolError::ExecutionFailed(format!("{} - {}", status, body)));
            }
        }

        let result: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid tool response: {}", e)))?;
        Ok(ToolOutcome {
            output: result.output,
            error: result.error.filter(|e| !e.is_empty()),
            duration: Duration::from_millis(result.duration_ms),
            metadata: result.metadata,
        })
    }
}

#[async_trait]
impl ToolExecutor for RemoteToolExecutor {
    async fn execute(
        &self,
        name: &str,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> ToolResult<ToolOutcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            outcome = self.call(name, input) => outcome,
        }
    }

    async fn list_tools(&self) -> Vec<ToolInfo> {
        let response = self
            .client
            .get(format!("{}/tools", self.endpoint))
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let tools = match response {
            Ok(response) => response.json::<Vec<ToolInfo>>().await,
            Err(e) => Err(e),
        };
        match tools {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("tool catalog unavailable: {}", e);
                Vec::new()
            }
        }
    }
}
