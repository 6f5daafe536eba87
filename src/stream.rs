//! Replayable multi-consumer stream
//!
//! One producer appends chunks to a shared, append-only buffer; any number
//! of independent readers consume it, each tracking its own cursor. A
//! reader attached after production started replays everything already
//! buffered before blocking on new chunks, so late and parallel consumers
//! all observe the identical sequence. Dropping a reader never affects the
//! producer or other readers; only a stream-level `cancel` tears the
//! producer down.

use std::sync::Arc;

use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

/// Lifecycle of a stream, derived from its buffer and close flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing buffered yet
    Initial,
    /// Producing
    Streaming,
    /// End sentinel appended
    Finished,
    /// Producer raised
    Error,
}

struct Inner<T> {
    buffer: Vec<T>,
    done: bool,
    error: Option<String>,
    producer: Option<JoinHandle<()>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

/// Buffering stream handle; cloning shares the same buffer and producer.
pub struct ReplayableStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ReplayableStream<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Clone + Send + 'static> ReplayableStream<T> {
    fn empty() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    buffer: Vec::new(),
                    done: false,
                    error: None,
                    producer: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Stream over a finite, already-known sequence; immediately finished.
    pub fn from_chunks(chunks: Vec<T>) -> Self {
        let stream = Self::empty();
        {
            let mut inner = stream.shared.inner.lock();
            inner.buffer = chunks;
            inner.done = true;
        }
        stream
    }

    /// Stream fed by an async producer. The producer task is owned by the
    /// stream and torn down on [`cancel`](Self::cancel).
    pub fn from_stream(mut source: BoxStream<'static, Result<T, String>>) -> Self {
        let stream = Self::empty();
        let writer = stream.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(chunk) => writer.push(chunk),
                    Err(message) => {
                        writer.fail(message);
                        return;
                    }
                }
            }
            writer.finish();
        });
        stream.shared.inner.lock().producer = Some(handle);
        stream
    }

    /// Producer + handle pair for callers that push chunks directly
    pub fn channel() -> (Self, StreamProducer<T>) {
        let stream = Self::empty();
        let producer = StreamProducer { shared: Arc::clone(&stream.shared) };
        (stream, producer)
    }

    fn push(&self, chunk: T) {
        let mut inner = self.shared.inner.lock();
        if inner.done {
            return;
        }
        inner.buffer.push(chunk);
        drop(inner);
        self.shared.notify.notify_waiters();
    }

    fn finish(&self) {
        self.shared.inner.lock().done = true;
        self.shared.notify.notify_waiters();
    }

    fn fail(&self, message: String) {
        {
            let mut inner = self.shared.inner.lock();
            inner.error = Some(message);
            inner.done = true;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn state(&self) -> StreamState {
        let inner = self.shared.inner.lock();
        if inner.error.is_some() {
            StreamState::Error
        } else if inner.done {
            StreamState::Finished
        } else if inner.buffer.is_empty() {
            StreamState::Initial
        } else {
            StreamState::Streaming
        }
    }

    pub fn error(&self) -> Option<String> {
        self.shared.inner.lock().error.clone()
    }

    /// Chunks emitted so far
    pub fn snapshot(&self) -> Vec<T> {
        self.shared.inner.lock().buffer.clone()
    }

    /// Independent reader starting at the beginning of the buffer
    pub fn reader(&self) -> StreamReader<T> {
        StreamReader { shared: Arc::clone(&self.shared), cursor: 0 }
    }

    /// Tear down the producer; buffered chunks stay readable.
    pub fn cancel(&self) {
        let handle = {
            let mut inner = self.shared.inner.lock();
            inner.done = true;
            inner.producer.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.notify.notify_waiters();
    }

    /// Wait until the producer finishes, collecting every chunk in order.
    pub async fn collect_all(&self) -> Vec<T> {
        let mut reader = self.reader();
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next().await {
            chunks.push(chunk);
        }
        chunks
    }
}

/// Push handle for a channel-style stream
pub struct StreamProducer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> StreamProducer<T> {
    pub fn push(&self, chunk: T) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.done {
                return;
            }
            inner.buffer.push(chunk);
        }
        self.shared.notify.notify_waiters();
    }

    pub fn finish(&self) {
        self.shared.inner.lock().done = true;
        self.shared.notify.notify_waiters();
    }

    pub fn fail(&self, message: impl Into<String>) {
        {
            let mut inner = self.shared.inner.lock();
            inner.error = Some(message.into());
            inner.done = true;
        }
        self.shared.notify.notify_waiters();
    }
}

/// Cursor-owning reader; cheap to create, safe to drop at any point
pub struct StreamReader<T> {
    shared: Arc<Shared<T>>,
    cursor: usize,
}

impl<T: Clone + Send + 'static> StreamReader<T> {
    /// Next chunk, replaying buffered history first; `None` after the end
    /// sentinel once the cursor has drained the buffer.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if let Some(step) = self.poll_buffer() {
                return step;
            }
            // Register for wakeup, then re-check to close the race with a
            // producer that appended between the check and the await
            let shared = self.shared.clone();
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(step) = self.poll_buffer() {
                return step;
            }
            notified.await;
        }
    }

    /// `Some(Some(chunk))` = chunk available, `Some(None)` = stream ended,
    /// `None` = would block
    fn poll_buffer(&mut self) -> Option<Option<T>> {
        let inner = self.shared.inner.lock();
        if self.cursor < inner.buffer.len() {
            let chunk = inner.buffer[self.cursor].clone();
            self.cursor += 1;
            return Some(Some(chunk));
        }
        if inner.done {
            return Some(None);
        }
        None
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl futures::Stream<Item = T> + Send
    where
        T: 'static,
    {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|chunk| (chunk, reader))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn finite_stream_replays_in_order() {
        let stream = ReplayableStream::from_chunks(vec![1, 2, 3]);
        assert_eq!(stream.state(), StreamState::Finished);
        let mut reader = stream.reader();
        assert_eq!(reader.next().await, Some(1));
        assert_eq!(reader.next().await, Some(2));
        assert_eq!(reader.next().await, Some(3));
        assert_eq!(reader.next().await, None);
        // Done is observed exactly once per reader, then stays done
        assert_eq!(reader.next().await, None);
    }

    #[tokio::test]
    async fn late_reader_catches_up_then_follows_live() {
        let (stream, producer) = ReplayableStream::channel();
        producer.push("a");
        producer.push("b");
        producer.push("c");
        assert_eq!(stream.state(), StreamState::Streaming);

        // Reader attaches after 3 chunks were produced
        let mut late = stream.reader();
        assert_eq!(late.next().await, Some("a"));
        assert_eq!(late.next().await, Some("b"));
        assert_eq!(late.next().await, Some("c"));

        let waiter = tokio::spawn(async move {
            let mut collected = Vec::new();
            while let Some(chunk) = late.next().await {
                collected.push(chunk);
            }
            collected
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.push("d");
        producer.finish();

        assert_eq!(waiter.await.unwrap(), vec!["d"]);
        assert_eq!(stream.state(), StreamState::Finished);
    }

    #[tokio::test]
    async fn readers_are_independent() {
        let (stream, producer) = ReplayableStream::channel();
        producer.push(10);
        let mut first = stream.reader();
        let mut second = stream.reader();
        assert_eq!(first.next().await, Some(10));

        // Dropping one reader does not disturb the other or the producer
        drop(first);
        producer.push(20);
        producer.finish();
        assert_eq!(second.next().await, Some(10));
        assert_eq!(second.next().await, Some(20));
        assert_eq!(second.next().await, None);
    }

    #[tokio::test]
    async fn producer_error_surfaces_as_error_state() {
        let source = futures::stream::iter(vec![Ok(1), Err("boom".to_string())]);
        let stream = ReplayableStream::from_stream(Box::pin(source));
        let mut reader = stream.reader();
        assert_eq!(reader.next().await, Some(1));
        assert_eq!(reader.next().await, None);
        assert_eq!(stream.state(), StreamState::Error);
        assert_eq!(stream.error().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancel_stops_production_but_keeps_buffer() {
        let (stream, producer) = ReplayableStream::channel();
        producer.push(1);
        stream.cancel();
        // Late pushes after cancel are dropped
        producer.push(2);
        let mut reader = stream.reader();
        assert_eq!(reader.next().await, Some(1));
        assert_eq!(reader.next().await, None);
    }

    #[test]
    fn initial_state_before_any_chunk() {
        // No producer task involved, so a plain blocking runtime suffices
        tokio_test::block_on(async {
            let (stream, producer) = ReplayableStream::<u8>::channel();
            assert_eq!(stream.state(), StreamState::Initial);
            producer.push(1);
            assert_eq!(stream.state(), StreamState::Streaming);
        });
    }
}
