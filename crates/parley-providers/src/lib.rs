//! Streaming service abstraction.
//!
//! Each backend implements one of [`SpeechToText`], [`LanguageModel`] or
//! [`TextToSpeech`]. Starting a service returns a [`StreamHandle`]: a bounded
//! input sender, a lazy output stream and a cancellation token. Output of a
//! single turn is terminated by an end-of-turn marker rather than by closing
//! the stream, so one handle can serve many turns.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_core::transcript::Message;

pub mod cartesia;
pub mod chat;
pub mod deepgram;
pub mod registry;
pub mod scripted;
pub mod sse;

pub use registry::ServiceRegistry;

const INPUT_CAPACITY: usize = 64;
const OUTPUT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream closed")]
    Closed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service misconfigured: {0}")]
    Config(String),
}

/// Session-level options handed to `start`.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bound on connecting and on each request round trip.
    pub timeout: Duration,
    /// Parent token; handles are cancelled with it.
    pub session: CancellationToken,
    /// Flat named values merged over the configured ones and passed through unmodified.
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            timeout: Duration::from_secs(5),
            session: CancellationToken::new(),
            params: serde_json::Map::new(),
        }
    }
}

impl ServiceOptions {
    /// Configured params overlaid with the per-session ones.
    pub fn merged_params(
        &self,
        configured: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut merged = configured.clone();
        for (k, v) in &self.params {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// A running stream against one backend.
///
/// `Send + Sync`, so stages can hold a borrow of it across an await.
pub struct StreamHandle<I, O> {
    input: mpsc::Sender<I>,
    output: mpsc::Receiver<Result<O, ServiceError>>,
    cancel: CancellationToken,
}

impl<I, O> StreamHandle<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        input: mpsc::Sender<I>,
        output: mpsc::Receiver<Result<O, ServiceError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            input,
            output,
            cancel,
        }
    }

    /// Push input into the backend.
    ///
    /// The returned future owns a clone of the input sender and does not
    /// borrow the handle.
    pub fn push(
        &self,
        item: I,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send + use<I, O> {
        let input = self.input.clone();
        let cancel = self.cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return Err(ServiceError::Closed);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ServiceError::Closed),
                sent = input.send(item) => sent.map_err(|_| ServiceError::Closed),
            }
        }
    }

    /// Next output item; `None` once the backend has shut down.
    pub async fn next(&mut self) -> Option<Result<O, ServiceError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.output.recv() => item,
        }
    }

    /// Abort in-flight work. Output stops immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<I, O> Drop for StreamHandle<I, O> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `worker` on its own task and wrap its channels in a [`StreamHandle`].
///
/// The worker is dropped as soon as the handle is cancelled.
pub fn spawn_stream<I, O, F, Fut>(parent: &CancellationToken, worker: F) -> StreamHandle<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnOnce(mpsc::Receiver<I>, mpsc::Sender<Result<O, ServiceError>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
    let cancel = parent.child_token();

    let fut = worker(input_rx, output_tx);
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = fut => {}
        }
    });

    StreamHandle::new(input_tx, output_rx, cancel)
}

// --- Speech to text ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn id(&self) -> &str;

    /// Open a transcription stream. Input is PCM16 audio.
    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<Bytes, TranscriptEvent>, ServiceError>;
}

// --- Generation ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Delta(String),
    EndOfTurn,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn id(&self) -> &str;

    /// Open a generation stream. Each pushed context yields deltas then `EndOfTurn`.
    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<Vec<Message>, GenerationEvent>, ServiceError>;
}

// --- Synthesis ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisInput {
    Text(String),
    /// No more text for this turn.
    Flush,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// PCM16 audio at the session sample rate.
    Audio(Bytes),
    EndOfTurn,
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn id(&self) -> &str;

    /// Open a synthesis stream. Audio for a turn is followed by `EndOfTurn` after `Flush`.
    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<SynthesisInput, SynthesisEvent>, ServiceError>;
}

/// Render a flat option value the way query strings and headers expect it.
pub fn param_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
