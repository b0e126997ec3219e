//! SSE wire protocol for run event streams.
//!
//! Frames are encoded here byte for byte (`event: <type>\ndata: <json>\n\n`)
//! and fanned out per run through a [`StreamHub`]. Finished streams keep
//! their terminal frame so a late reconnect replays exactly the same bytes.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;

use async_stream::stream;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use crate::error_taxonomy::ErrorEnvelope;
use crate::models::{Run, StreamMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Metadata,
    Values,
    Updates,
    MessagesMetadata,
    MessagesPartial,
    Error,
}

impl FrameKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Values => "values",
            Self::Updates => "updates",
            Self::MessagesMetadata => "messages/metadata",
            Self::MessagesPartial => "messages/partial",
            Self::Error => "error",
        }
    }

    /// The `stream_mode` that must be requested for this frame to be sent.
    /// `None` means always sent.
    #[must_use]
    pub fn mode(self) -> Option<StreamMode> {
        match self {
            Self::Metadata | Self::Error => None,
            Self::Values => Some(StreamMode::Values),
            Self::Updates => Some(StreamMode::Updates),
            Self::MessagesMetadata | Self::MessagesPartial => Some(StreamMode::Messages),
        }
    }
}

/// One encoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub bytes: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(kind: FrameKind, data: &Value) -> Self {
        Self {
            kind,
            bytes: encode_frame(kind.as_str(), data),
        }
    }

    #[must_use]
    pub fn metadata(run_id: &str, attempt: u32) -> Self {
        Self::new(
            FrameKind::Metadata,
            &json!({ "run_id": run_id, "attempt": attempt }),
        )
    }

    #[must_use]
    pub fn values(state: &Value) -> Self {
        Self::new(FrameKind::Values, state)
    }

    #[must_use]
    pub fn updates(node: &str, delta: &Value) -> Self {
        Self::new(FrameKind::Updates, &json!({ node: delta }))
    }

    #[must_use]
    pub fn message_metadata(message_id: &str, metadata: &Value) -> Self {
        Self::new(
            FrameKind::MessagesMetadata,
            &json!({ message_id: { "metadata": metadata } }),
        )
    }

    #[must_use]
    pub fn message_partial(message: &Value) -> Self {
        Self::new(FrameKind::MessagesPartial, &json!([message]))
    }

    #[must_use]
    pub fn error(envelope: &ErrorEnvelope) -> Self {
        let data = serde_json::to_value(envelope).unwrap_or_else(|_| json!({}));
        Self::new(FrameKind::Error, &data)
    }

    #[must_use]
    pub fn allowed_by(&self, modes: &[StreamMode]) -> bool {
        self.kind.mode().is_none_or(|mode| modes.contains(&mode))
    }
}

/// Encode a single SSE frame. Compact JSON never contains raw newlines.
#[must_use]
pub fn encode_frame(event: &str, data: &Value) -> Bytes {
    let payload = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
    Bytes::from(format!("event: {event}\ndata: {payload}\n\n"))
}

/// What a reader gets when it attaches to a run's stream.
#[derive(Debug)]
pub enum Subscription {
    Live(mpsc::UnboundedReceiver<Frame>),
    Finished(Frame),
}

/// Final record and frame kept for late reconnects.
#[derive(Debug, Clone)]
pub struct Retained {
    pub run: Run,
    pub frame: Frame,
}

struct RunStream {
    /// `None` once the run finished.
    readers: Option<Vec<mpsc::UnboundedSender<Frame>>>,
    terminal: Option<Retained>,
}

impl RunStream {
    fn attach(&mut self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        let readers = self.readers.as_mut()?;
        let (tx, rx) = mpsc::unbounded_channel();
        readers.push(tx);
        Some(rx)
    }
}

struct HubState {
    streams: HashMap<String, RunStream>,
    finished: VecDeque<String>,
}

/// Per-run fan-out of encoded frames.
///
/// Every reader owns an unbounded queue, so a slow client delays only
/// itself and never loses frames.
pub struct StreamHub {
    state: Mutex<HubState>,
    retention: usize,
}

impl StreamHub {
    #[must_use]
    pub fn new(retention: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                streams: HashMap::new(),
                finished: VecDeque::new(),
            }),
            retention: retention.max(1),
        }
    }

    /// Register a run and attach the first reader before any frame is sent.
    pub async fn open(&self, run_id: &str) -> mpsc::UnboundedReceiver<Frame> {
        let mut state = self.state.lock().await;
        let entry = state
            .streams
            .entry(run_id.to_string())
            .or_insert_with(|| RunStream {
                readers: Some(Vec::new()),
                terminal: None,
            });
        // Reopening a finished run yields a closed receiver.
        entry
            .attach()
            .unwrap_or_else(|| mpsc::unbounded_channel().1)
    }

    pub async fn publish(&self, run_id: &str, frame: Frame) {
        let mut state = self.state.lock().await;
        if let Some(readers) = state
            .streams
            .get_mut(run_id)
            .and_then(|stream| stream.readers.as_mut())
        {
            readers.retain(|reader| reader.send(frame.clone()).is_ok());
        }
    }

    /// Send the terminal frame, close live readers and retain it for replay.
    pub async fn finish(&self, run: &Run, frame: Frame) {
        let mut state = self.state.lock().await;
        let Some(stream) = state.streams.get_mut(&run.run_id) else {
            return;
        };
        let Some(readers) = stream.readers.take() else {
            return;
        };
        for reader in readers {
            let _ = reader.send(frame.clone());
        }
        stream.terminal = Some(Retained {
            run: run.clone(),
            frame,
        });
        state.finished.push_back(run.run_id.clone());
        while state.finished.len() > self.retention {
            if let Some(evicted) = state.finished.pop_front() {
                state.streams.remove(&evicted);
            }
        }
    }

    pub async fn subscribe(&self, run_id: &str) -> Option<Subscription> {
        let mut state = self.state.lock().await;
        let stream = state.streams.get_mut(run_id)?;
        if let Some(receiver) = stream.attach() {
            return Some(Subscription::Live(receiver));
        }
        stream
            .terminal
            .as_ref()
            .map(|retained| Subscription::Finished(retained.frame.clone()))
    }

    /// The final record and frame of a finished run still in the retention window.
    pub async fn retained(&self, run_id: &str) -> Option<Retained> {
        let state = self.state.lock().await;
        state.streams.get(run_id)?.terminal.clone()
    }

    pub async fn forget(&self, run_id: &str) {
        let mut state = self.state.lock().await;
        state.streams.remove(run_id);
        state.finished.retain(|id| id != run_id);
    }
}

/// Runs a callback if the reader goes away before the stream completed.
pub struct DisconnectGuard {
    on_disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl DisconnectGuard {
    #[must_use]
    pub fn new(on_disconnect: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self { on_disconnect }
    }

    pub fn disarm(&mut self) {
        self.on_disconnect = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.on_disconnect.take() {
            callback();
        }
    }
}

/// Turn a subscription into the body stream a client reads.
pub fn frame_stream(
    subscription: Subscription,
    modes: Vec<StreamMode>,
    mut guard: DisconnectGuard,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    stream! {
        match subscription {
            Subscription::Finished(frame) => {
                if frame.allowed_by(&modes) {
                    yield Ok(frame.bytes);
                }
            }
            Subscription::Live(mut receiver) => {
                while let Some(frame) = receiver.recv().await {
                    if frame.allowed_by(&modes) {
                        yield Ok(frame.bytes);
                    }
                }
            }
        }
        guard.disarm();
    }
}

/// Wrap a frame stream in an SSE response with buffering disabled.
pub fn sse_response<S>(location: &str, body: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut response = (StatusCode::OK, Body::from_stream(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert(header::CONTENT_LOCATION, value);
    }
    response
}
