//! Mock provider for testing
//!
//! Returns configurable responses without making real API calls; streaming
//! mode splits the response into word-sized deltas so replay and late-reader
//! behavior get exercised realistically.

use super::{PromptRequest, PromptResponse, Provider, TokenUsage};
use crate::step::StepChunk;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::Arc;

/// Mock provider with a FIFO queue of canned responses
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    default_response: String,
    /// Requests made, for assertions
    requests: Arc<Mutex<Vec<PromptRequest>>>,
    fail_next: Arc<Mutex<bool>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![])),
            default_response: "Mock response".to_string(),
            requests: Arc::new(Mutex::new(vec![])),
            fail_next: Arc::new(Mutex::new(false)),
        }
    }

    /// Create with a queue of responses (FIFO)
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::new()
        }
    }

    /// Set the default response used when the queue is empty
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    pub fn queue_response(&self, response: impl Into<String>) {
        self.responses.lock().push(response.into());
    }

    /// Make the next execution fail (for error-routing tests)
    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }

    pub fn requests(&self) -> Vec<PromptRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<PromptRequest> {
        self.requests.lock().last().cloned()
    }

    fn next_response(&self) -> String {
        let mut queue = self.responses.lock();
        if queue.is_empty() {
            self.default_response.clone()
        } else {
            queue.remove(0)
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, request: PromptRequest) -> Result<PromptResponse> {
        self.requests.lock().push(request.clone());

        if std::mem::take(&mut *self.fail_next.lock()) {
            return Ok(PromptResponse::failure("mock failure"));
        }

        let content = self.next_response();
        let usage = TokenUsage::estimate(request.prompt.len(), content.len());
        Ok(PromptResponse::success(content).with_usage(usage))
    }

    async fn execute_stream(
        &self,
        request: PromptRequest,
    ) -> Result<BoxStream<'static, Result<StepChunk, String>>> {
        self.requests.lock().push(request);

        if std::mem::take(&mut *self.fail_next.lock()) {
            return Ok(Box::pin(futures::stream::iter(vec![Err(
                "mock failure".to_string()
            )])));
        }

        let content = self.next_response();
        // Word-by-word deltas, whitespace preserved
        let mut chunks = Vec::new();
        let mut current = String::new();
        for c in content.chars() {
            current.push(c);
            if c.is_whitespace() {
                chunks.push(Ok(StepChunk::Text { delta: std::mem::take(&mut current) }));
            }
        }
        if !current.is_empty() {
            chunks.push(Ok(StepChunk::Text { delta: current }));
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn is_available(&self) -> bool {
        true
    }
}
