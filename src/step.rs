//! StepValue: the memoized, multi-shape result of one action execution
//!
//! A step's output arrives as a chunk stream; callers ask for it in the
//! shape they need (`text`, `object`, `tool_calls`, ...). Each accessor
//! drains a private reader over the replayable stream, computes its answer
//! at most once per instance, and memoizes it, so repeated access is free
//! and different consumers never re-trigger work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::stream::{ReplayableStream, StreamReader, StreamState};

/// One incremental unit of action output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepChunk {
    /// Incremental text delta
    Text { delta: String },
    /// Structured object payload (replaces earlier objects)
    Object { value: Value },
    /// A tool invocation requested by the action
    ToolCall { id: String, name: String, arguments: Value },
    /// The result of a tool invocation
    ToolResult { id: String, result: Value },
    /// Action-level failure
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub result: Value,
}

/// Lazily-populated result record for one executed element
pub struct StepValue {
    stream: ReplayableStream<StepChunk>,
    text: OnceCell<Option<String>>,
    object: OnceCell<Option<Value>>,
    tool_calls: OnceCell<Vec<ToolCall>>,
    tool_results: OnceCell<Vec<ToolResult>>,
    error: OnceCell<Option<String>>,
}

impl StepValue {
    pub fn from_stream(stream: ReplayableStream<StepChunk>) -> Self {
        Self {
            stream,
            text: OnceCell::new(),
            object: OnceCell::new(),
            tool_calls: OnceCell::new(),
            tool_results: OnceCell::new(),
            error: OnceCell::new(),
        }
    }

    pub fn from_chunks(chunks: Vec<StepChunk>) -> Self {
        Self::from_stream(ReplayableStream::from_chunks(chunks))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_chunks(vec![StepChunk::Text { delta: text.into() }])
    }

    pub fn from_object(value: Value) -> Self {
        Self::from_chunks(vec![StepChunk::Object { value }])
    }

    pub fn from_error(message: impl Into<String>) -> Self {
        Self::from_chunks(vec![StepChunk::Error { message: message.into() }])
    }

    /// Empty, already-finished step (e.g. a skipped element)
    pub fn empty() -> Self {
        Self::from_chunks(Vec::new())
    }

    /// Raw chunk reader; replays history for late consumers
    pub fn stream(&self) -> StreamReader<StepChunk> {
        self.stream.reader()
    }

    /// Underlying stream handle (for forwarding into a run-level stream)
    pub fn raw_stream(&self) -> ReplayableStream<StepChunk> {
        self.stream.clone()
    }

    /// Concatenated text content; `None` when the step produced no text
    pub async fn text(&self) -> Option<String> {
        self.text
            .get_or_init(|| async {
                let mut reader = self.stream.reader();
                let mut out = String::new();
                let mut any = false;
                while let Some(chunk) = reader.next().await {
                    if let StepChunk::Text { delta } = chunk {
                        out.push_str(&delta);
                        any = true;
                    }
                }
                any.then_some(out)
            })
            .await
            .clone()
    }

    /// Structured object payload: the last `Object` chunk, or the full text
    /// parsed as JSON when no object was emitted
    pub async fn object(&self) -> Option<Value> {
        self.object
            .get_or_init(|| async {
                let mut reader = self.stream.reader();
                let mut last = None;
                let mut text = String::new();
                while let Some(chunk) = reader.next().await {
                    match chunk {
                        StepChunk::Object { value } => last = Some(value),
                        StepChunk::Text { delta } => text.push_str(&delta),
                        _ => {}
                    }
                }
                last.or_else(|| serde_json::from_str(text.trim()).ok())
            })
            .await
            .clone()
    }

    pub async fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .get_or_init(|| async {
                let mut reader = self.stream.reader();
                let mut calls = Vec::new();
                while let Some(chunk) = reader.next().await {
                    if let StepChunk::ToolCall { id, name, arguments } = chunk {
                        calls.push(ToolCall { id, name, arguments });
                    }
                }
                calls
            })
            .await
            .clone()
    }

    pub async fn tool_results(&self) -> Vec<ToolResult> {
        self.tool_results
            .get_or_init(|| async {
                let mut reader = self.stream.reader();
                let mut results = Vec::new();
                while let Some(chunk) = reader.next().await {
                    if let StepChunk::ToolResult { id, result } = chunk {
                        results.push(ToolResult { id, result });
                    }
                }
                results
            })
            .await
            .clone()
    }

    /// First error chunk, or the stream's own failure
    pub async fn error(&self) -> Option<String> {
        self.error
            .get_or_init(|| async {
                let mut reader = self.stream.reader();
                while let Some(chunk) = reader.next().await {
                    if let StepChunk::Error { message } = chunk {
                        return Some(message);
                    }
                }
                self.stream.error()
            })
            .await
            .clone()
    }

    pub async fn is_error(&self) -> bool {
        self.error().await.is_some()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }
}

impl std::fmt::Debug for StepValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepValue").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn text_concatenates_deltas() {
        let step = StepValue::from_chunks(vec![
            StepChunk::Text { delta: "Hel".into() },
            StepChunk::Text { delta: "lo".into() },
        ]);
        assert_eq!(step.text().await.as_deref(), Some("Hello"));
        // Memoized: second call returns the same value without re-reading
        assert_eq!(step.text().await.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn object_prefers_object_chunks_then_json_text() {
        let step = StepValue::from_chunks(vec![StepChunk::Object { value: json!({"a": 1}) }]);
        assert_eq!(step.object().await, Some(json!({"a": 1})));

        let textual = StepValue::from_text(r#"{"b": 2}"#);
        assert_eq!(textual.object().await, Some(json!({"b": 2})));

        let prose = StepValue::from_text("not json");
        assert_eq!(prose.object().await, None);
    }

    #[tokio::test]
    async fn tool_calls_and_results_collect() {
        let step = StepValue::from_chunks(vec![
            StepChunk::ToolCall { id: "1".into(), name: "search".into(), arguments: json!({"q": "x"}) },
            StepChunk::ToolResult { id: "1".into(), result: json!(["hit"]) },
        ]);
        let calls = step.tool_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        let results = step.tool_results().await;
        assert_eq!(results[0].result, json!(["hit"]));
    }

    #[tokio::test]
    async fn error_accessor() {
        let step = StepValue::from_error("kaput");
        assert_eq!(step.error().await.as_deref(), Some("kaput"));
        assert!(step.is_error().await);

        let fine = StepValue::from_text("ok");
        assert_eq!(fine.error().await, None);
    }

    #[tokio::test]
    async fn multiple_consumers_share_one_instance() {
        let step = StepValue::from_chunks(vec![
            StepChunk::Text { delta: "x".into() },
            StepChunk::Object { value: json!(7) },
        ]);
        // Different accessors each get their own full replay
        assert_eq!(step.text().await.as_deref(), Some("x"));
        assert_eq!(step.object().await, Some(json!(7)));
        let mut raw = step.stream();
        assert!(raw.next().await.is_some());
    }
}
