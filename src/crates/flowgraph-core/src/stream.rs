//! Lazy value streams and the algebra the engine needs over them
//!
//! A [`StreamReader`] is a type-erased, single-consumer sequence of JSON
//! chunks. Graph edges need five operations on it:
//!
//! | Operation | Used for | Function |
//! |-----------|----------|----------|
//! | copy | fan-out to several successors | [`StreamReader::copy`] |
//! | convert | field mappings and checks per chunk | [`StreamReader::convert`] |
//! | merge | fan-in from several predecessors | [`StreamReader::merge_named`] |
//! | concat | collapsing to one value (checkpoint, invoke-style nodes) | [`MergeRegistry::concat_stream`](crate::MergeRegistry::concat_stream) |
//! | wrap/unwrap | typed access for node bodies | [`StreamReader::pack`], [`StreamReader::unpack`] |
//!
//! # Frames
//!
//! Internally a stream carries [`Frame`]s. Besides ordinary chunks, a merged
//! stream may carry `SourceEof(name)` markers telling the consumer that one
//! named predecessor finished. [`StreamReader::recv`] skips markers;
//! [`StreamReader::recv_frame`] exposes them.
//!
//! # Copy
//!
//! ```text
//!                ┌──────────── shared buffer ────────────┐
//!   source ───>  │ [c3] [c4] [c5] [c6]                   │
//!                └───▲─────────▲──────────────▲──────────┘
//!                 cursor 0   cursor 1      cursor 2
//! ```
//!
//! All copies pull from one synchronized buffer. Whichever cursor runs ahead
//! pulls the next chunk from the source; chunks every cursor has passed are
//! dropped. The source is released once it is exhausted or every cursor is
//! gone.

use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{GraphError, Result};

/// One element of a stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Chunk(Value),
    /// The named source of a merged stream has ended
    SourceEof(String),
}

type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Type-erased stream of JSON chunks
pub struct StreamReader {
    inner: FrameStream,
}

impl StreamReader {
    /// Wrap a stream of frames
    pub fn from_frames<S>(frames: S) -> Self
    where
        S: Stream<Item = Result<Frame>> + Send + 'static,
    {
        Self {
            inner: Box::pin(frames),
        }
    }

    /// Wrap a stream of values
    pub fn from_stream<S>(values: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::from_frames(values.map(|item| item.map(Frame::Chunk)))
    }

    pub fn from_vec(values: Vec<Value>) -> Self {
        Self::from_stream(stream::iter(values.into_iter().map(Ok)))
    }

    /// Stream with exactly one chunk
    pub fn single(value: Value) -> Self {
        Self::from_vec(vec![value])
    }

    pub fn empty() -> Self {
        Self::from_frames(stream::empty())
    }

    /// Next chunk, skipping source markers
    pub async fn recv(&mut self) -> Option<Result<Value>> {
        self.next().await
    }

    /// Next frame, including source markers
    pub async fn recv_frame(&mut self) -> Option<Result<Frame>> {
        self.inner.next().await
    }

    /// Drain every chunk; fails on the first error chunk
    pub async fn collect_values(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(item) = self.recv().await {
            values.push(item?);
        }
        Ok(values)
    }

    /// Map each chunk; returning `Ok(None)` drops it
    pub fn convert<F>(self, mut f: F) -> StreamReader
    where
        F: FnMut(Value) -> Result<Option<Value>> + Send + 'static,
    {
        let converted = self.inner.filter_map(move |item| {
            let out = match item {
                Ok(Frame::Chunk(value)) => match f(value) {
                    Ok(Some(v)) => Some(Ok(Frame::Chunk(v))),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                },
                other => Some(other),
            };
            futures::future::ready(out)
        });
        StreamReader::from_frames(converted)
    }

    /// Split into `n` independent readers over one shared buffer
    pub fn copy(self, n: usize) -> Vec<StreamReader> {
        if n < 2 {
            return if n == 1 { vec![self] } else { Vec::new() };
        }
        let shared = Arc::new(CopyShared {
            state: Mutex::new(CopyState {
                buffer: VecDeque::new(),
                base: 0,
                cursors: vec![Some(0); n],
                finished: false,
            }),
            source: tokio::sync::Mutex::new(Some(self)),
        });
        (0..n)
            .map(|index| {
                let guard = CursorGuard {
                    shared: Arc::clone(&shared),
                    index,
                };
                StreamReader::from_frames(async_stream::stream! {
                    let guard = guard;
                    while let Some(item) = guard.shared.next_for(guard.index).await {
                        yield item;
                    }
                })
            })
            .collect()
    }

    /// Interleave several streams in arrival order
    pub fn merge(readers: Vec<StreamReader>) -> StreamReader {
        match readers.len() {
            0 => StreamReader::empty(),
            1 => readers.into_iter().next().unwrap_or_else(StreamReader::empty),
            _ => StreamReader::from_frames(stream::select_all(readers.into_iter().map(|r| r.inner))),
        }
    }

    /// Interleave named streams; with `emit_source_eof` a `SourceEof(name)`
    /// frame follows the last chunk of each source
    pub fn merge_named(readers: Vec<(String, StreamReader)>, emit_source_eof: bool) -> StreamReader {
        if !emit_source_eof {
            return Self::merge(readers.into_iter().map(|(_, r)| r).collect());
        }
        let tagged = readers.into_iter().map(|(name, reader)| {
            reader
                .inner
                .chain(stream::once(futures::future::ready(Ok(Frame::SourceEof(name)))))
                .boxed()
        });
        StreamReader::from_frames(stream::select_all(tagged))
    }

    /// Typed view of this stream (unwrap)
    pub fn unpack<T: DeserializeOwned>(self) -> TypedStreamReader<T> {
        TypedStreamReader {
            inner: self,
            _marker: PhantomData,
        }
    }

    /// Type-erase a typed stream (wrap)
    pub fn pack<T, S>(typed: S) -> StreamReader
    where
        T: Serialize,
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        StreamReader::from_stream(
            typed.map(|item| item.and_then(|v| serde_json::to_value(v).map_err(GraphError::from))),
        )
    }
}

impl Stream for StreamReader {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.inner.as_mut().poll_next(cx)) {
                Some(Ok(Frame::SourceEof(_))) => continue,
                Some(Ok(Frame::Chunk(value))) => return Poll::Ready(Some(Ok(value))),
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader").finish_non_exhaustive()
    }
}

/// Deserializing view over a [`StreamReader`]
pub struct TypedStreamReader<T> {
    inner: StreamReader,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedStreamReader<T> {
    pub async fn recv(&mut self) -> Option<Result<T>> {
        let item = self.inner.recv().await?;
        Some(item.and_then(|v| serde_json::from_value(v).map_err(GraphError::from)))
    }

    pub async fn collect_items(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Back to the erased form
    pub fn erase(self) -> StreamReader {
        self.inner
    }
}

/// Writing half of [`pipe`]
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Result<Value>>,
}

impl StreamWriter {
    /// Send a chunk; returns `true` when the reader is gone
    pub async fn send(&self, value: Value) -> bool {
        self.tx.send(Ok(value)).await.is_err()
    }

    /// Send an error chunk; returns `true` when the reader is gone
    pub async fn send_error(&self, err: GraphError) -> bool {
        self.tx.send(Err(err)).await.is_err()
    }

    /// Whether the reading half has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded channel whose receiving half is a [`StreamReader`].
///
/// The stream ends when every writer clone is dropped.
pub fn pipe(capacity: usize) -> (StreamWriter, StreamReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamWriter { tx },
        StreamReader::from_stream(ReceiverStream::new(rx)),
    )
}

struct CopyState {
    buffer: VecDeque<Result<Frame>>,
    /// Absolute index of `buffer[0]`
    base: usize,
    /// Next absolute index per cursor; `None` once dropped
    cursors: Vec<Option<usize>>,
    finished: bool,
}

impl CopyState {
    fn take(&mut self, index: usize) -> Option<Result<Frame>> {
        let position = self.cursors[index]?;
        let item = self.buffer.get(position - self.base)?;
        let item = match item {
            Ok(frame) => Ok(frame.clone()),
            Err(e) => Err(e.duplicate()),
        };
        self.cursors[index] = Some(position + 1);
        self.trim();
        Some(item)
    }

    fn has_item_for(&self, index: usize) -> bool {
        match self.cursors[index] {
            Some(position) => position < self.base + self.buffer.len(),
            None => false,
        }
    }

    fn trim(&mut self) {
        let lowest = self
            .cursors
            .iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or(self.base + self.buffer.len());
        while self.base < lowest && !self.buffer.is_empty() {
            self.buffer.pop_front();
            self.base += 1;
        }
    }
}

struct CopyShared {
    state: Mutex<CopyState>,
    source: tokio::sync::Mutex<Option<StreamReader>>,
}

impl CopyShared {
    async fn next_for(&self, index: usize) -> Option<Result<Frame>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.take(index) {
                    return Some(item);
                }
                if state.finished {
                    return None;
                }
            }

            let mut source = self.source.lock().await;
            {
                let state = self.state.lock();
                if state.has_item_for(index) || state.finished {
                    continue;
                }
            }
            let next = match source.as_mut() {
                Some(reader) => reader.recv_frame().await,
                None => None,
            };
            let mut state = self.state.lock();
            match next {
                Some(item) => state.buffer.push_back(item),
                None => {
                    state.finished = true;
                    *source = None;
                }
            }
        }
    }
}

struct CursorGuard {
    shared: Arc<CopyShared>,
    index: usize,
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.cursors[self.index] = None;
        state.trim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[tokio::test]
    async fn test_from_vec_and_collect() {
        let reader = StreamReader::from_vec(vec![json!(1), json!(2)]);
        assert_eq!(reader.collect_values().await.unwrap(), vec![json!(1), json!(2)]);
        assert!(StreamReader::empty().collect_values().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_convert_maps_and_filters() {
        let reader = StreamReader::from_vec(vec![json!(1), json!(2), json!(3), json!(4)]);
        let evens = reader.convert(|v| {
            let n = v.as_i64().unwrap_or(0);
            Ok((n % 2 == 0).then(|| json!(n * 10)))
        });
        assert_eq!(evens.collect_values().await.unwrap(), vec![json!(20), json!(40)]);
    }

    #[tokio::test]
    async fn test_convert_propagates_error_per_chunk() {
        let reader = StreamReader::from_vec(vec![json!("a"), json!(1)]);
        let mut checked = reader.convert(|v| {
            if v.is_string() {
                Ok(Some(v))
            } else {
                Err(GraphError::RuntimeType("expected string".into()))
            }
        });
        assert_eq!(checked.recv().await.unwrap().unwrap(), json!("a"));
        assert!(checked.recv().await.unwrap().is_err());
        assert!(checked.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_copy_yields_same_sequence_to_every_cursor() {
        let copies = StreamReader::from_vec((0..50).map(|i| json!(i)).collect()).copy(3);
        assert_eq!(copies.len(), 3);

        let results = futures::future::join_all(copies.into_iter().map(|c| c.collect_values())).await;
        for result in results {
            let values = result.unwrap();
            assert_eq!(values.len(), 50);
            assert_eq!(values[49], json!(49));
        }
    }

    #[tokio::test]
    async fn test_copy_survives_dropped_cursor() {
        let mut copies = StreamReader::from_vec(vec![json!("x"), json!("y")]).copy(2);
        let dropped = copies.pop();
        drop(dropped);
        let remaining = copies.pop().unwrap();
        assert_eq!(remaining.collect_values().await.unwrap(), vec![json!("x"), json!("y")]);
    }

    #[tokio::test]
    async fn test_copy_trims_consumed_chunks() {
        let (writer, reader) = pipe(4);
        let mut copies = reader.copy(2);
        writer.send(json!(1)).await;
        writer.send(json!(2)).await;
        drop(writer);

        let mut b = copies.pop().unwrap();
        let mut a = copies.pop().unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), json!(1));
        assert_eq!(b.recv().await.unwrap().unwrap(), json!(1));
        assert_eq!(a.recv().await.unwrap().unwrap(), json!(2));
        assert_eq!(b.recv().await.unwrap().unwrap(), json!(2));
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_merge_named_emits_source_eof() {
        let merged = StreamReader::merge_named(
            vec![
                ("left".to_string(), StreamReader::from_vec(vec![json!(1)])),
                ("right".to_string(), StreamReader::empty()),
            ],
            true,
        );
        let mut merged = merged;
        let mut chunks = Vec::new();
        let mut ended = Vec::new();
        while let Some(frame) = merged.recv_frame().await {
            match frame.unwrap() {
                Frame::Chunk(v) => chunks.push(v),
                Frame::SourceEof(name) => ended.push(name),
            }
        }
        ended.sort();
        assert_eq!(chunks, vec![json!(1)]);
        assert_eq!(ended, vec!["left".to_string(), "right".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_without_markers_skips_nothing() {
        let merged = StreamReader::merge_named(
            vec![
                ("a".to_string(), StreamReader::from_vec(vec![json!(1), json!(2)])),
                ("b".to_string(), StreamReader::from_vec(vec![json!(3)])),
            ],
            false,
        );
        let mut values = merged.collect_values().await.unwrap();
        values.sort_by_key(|v| v.as_i64());
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_pipe_ends_when_writers_drop() {
        let (writer, reader) = pipe(1);
        let handle = tokio::spawn(async move {
            for i in 0..3 {
                assert!(!writer.send(json!(i)).await);
            }
        });
        assert_eq!(reader.collect_values().await.unwrap().len(), 3);
        handle.await.unwrap();
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Token {
        text: String,
    }

    #[tokio::test]
    async fn test_pack_and_unpack() {
        let typed = stream::iter(vec![
            Ok(Token { text: "he".into() }),
            Ok(Token { text: "llo".into() }),
        ]);
        let erased = StreamReader::pack(typed);
        let tokens = erased.unpack::<Token>().collect_items().await.unwrap();
        assert_eq!(tokens[1], Token { text: "llo".into() });

        let mut wrong = StreamReader::single(json!(5)).unpack::<Token>();
        assert!(matches!(wrong.recv().await, Some(Err(GraphError::Serialization(_)))));
    }
}
