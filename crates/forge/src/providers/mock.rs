use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{ForgeError, ForgeResult};
use crate::providers::base::{ChunkStream, ModelRequest, ModelResponse, Provider, StreamChunk};

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    name: String,
    available: AtomicBool,
    responses: Arc<Mutex<Vec<ForgeResult<ModelResponse>>>>,
    /// Served once the queue above is empty
    repeat: Option<ModelResponse>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
    models: Vec<String>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new<S: Into<String>>(name: S, responses: Vec<ModelResponse>) -> Self {
        Self {
            name: name.into(),
            available: AtomicBool::new(true),
            responses: Arc::new(Mutex::new(responses.into_iter().map(Ok).collect())),
            repeat: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            models: Vec::new(),
        }
    }

    pub fn failing<S: Into<String>>(name: S, error: ForgeError) -> Self {
        let provider = Self::new(name, Vec::new());
        provider.responses.lock().unwrap().push(Err(error));
        provider
    }

    /// Answer every request with the same response
    pub fn repeating<S: Into<String>>(name: S, response: ModelResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(name, Vec::new())
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Requests as the provider received them
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> ForgeResult<ModelResponse> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Empty response if no more pre-configured responses
            Ok(self.repeat.clone().unwrap_or_default())
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> ForgeResult<ModelResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.next_response()
    }

    async fn stream_complete(&self, request: &ModelRequest) -> ForgeResult<ChunkStream> {
        let response = self.complete(request).await?;
        let words: Vec<ForgeResult<StreamChunk>> = response
            .content
            .split_inclusive(' ')
            .map(|w| Ok(StreamChunk::text(w)))
            .chain(std::iter::once(Ok(StreamChunk::done())))
            .collect();
        Ok(stream::iter(words).boxed())
    }

    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn models(&self) -> Vec<String> {
        self.models.clone()
    }
}
