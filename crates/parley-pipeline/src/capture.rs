//! Session audio capture.
//!
//! The transport stages copy every inbound and delivered outbound chunk onto
//! a tap channel. The capture sink buffers both tracks and, when the session
//! ends or is cancelled, hands the finished recording to the uploader exactly
//! once. The upload runs on the pool's task tracker so it outlives the session.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span};

use parley_core::token::GenerationToken;
use parley_media::{RecordingBuffer, Uploader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Arms the recorder for this session key.
    Start { session_key: String },
    /// Caller audio as received.
    Inbound(Bytes),
    /// Assistant audio as delivered to the transport.
    Outbound(Bytes),
    End,
}

/// Sending side of the capture tap, shared by the transport stages.
#[derive(Debug, Clone)]
pub struct CaptureTap {
    tx: mpsc::Sender<CaptureEvent>,
}

impl CaptureTap {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CaptureEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send an event. A recorder that already stopped is ignored.
    pub async fn send(&self, event: CaptureEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[derive(Default)]
struct CaptureState {
    session_key: Option<String>,
    buffer: RecordingBuffer,
}

impl CaptureState {
    /// Returns false once the session has ended.
    fn apply(&mut self, event: CaptureEvent) -> bool {
        match event {
            CaptureEvent::Start { session_key } => {
                if self.session_key.is_none() {
                    debug!(session = %session_key, "Recording armed");
                    self.session_key = Some(session_key);
                }
            }
            CaptureEvent::Inbound(pcm) if self.session_key.is_some() => {
                self.buffer.append_inbound(&pcm);
            }
            CaptureEvent::Outbound(pcm) if self.session_key.is_some() => {
                self.buffer.append_outbound(&pcm);
            }
            CaptureEvent::Inbound(_) | CaptureEvent::Outbound(_) => {}
            CaptureEvent::End => return false,
        }
        true
    }
}

/// Buffers a session's audio and uploads it when the session is over.
pub struct AudioCaptureSink {
    uploader: Arc<dyn Uploader>,
    bucket: String,
    sample_rate: u32,
    channels: u16,
    token: GenerationToken,
    tracker: TaskTracker,
}

impl AudioCaptureSink {
    /// `channels` selects the recording layout: 1 mixes both tracks, 2 keeps them apart.
    pub fn new(
        uploader: Arc<dyn Uploader>,
        bucket: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        token: GenerationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            uploader,
            bucket: bucket.into(),
            sample_rate,
            channels,
            token,
            tracker,
        }
    }

    /// Consume the tap until the session ends, then hand off the recording.
    pub async fn run(self, mut tap: mpsc::Receiver<CaptureEvent>) {
        let mut state = CaptureState::default();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    // Keep whatever the transport had already queued.
                    while let Ok(event) = tap.try_recv() {
                        if !state.apply(event) {
                            break;
                        }
                    }
                    break;
                }
                event = tap.recv() => event,
            };
            match event {
                Some(event) => {
                    if !state.apply(event) {
                        break;
                    }
                }
                None => break,
            }
        }
        self.hand_off(state);
    }

    fn hand_off(self, state: CaptureState) {
        let Some(session_key) = state.session_key else {
            debug!("Session never started, nothing recorded");
            return;
        };

        let recording = state
            .buffer
            .finish(session_key.clone(), self.sample_rate, self.channels);
        info!(
            session = %session_key,
            duration_ms = recording.duration().as_millis() as u64,
            uploader = self.uploader.name(),
            "Recording finished"
        );

        let uploader = self.uploader;
        let bucket = self.bucket;
        let span = info_span!("upload", session = %session_key);
        self.tracker.spawn(
            async move {
                match uploader.upload(recording, &bucket).await {
                    Ok(location) => {
                        info!(%location, "Recording uploaded");
                        #[cfg(feature = "metrics")]
                        metrics::counter!("recording_uploads_total", "outcome" => "ok").increment(1);
                    }
                    Err(e) => {
                        error!(%e, "Recording upload failed");
                        #[cfg(feature = "metrics")]
                        metrics::counter!("recording_uploads_total", "outcome" => "error").increment(1);
                    }
                }
            }
            .instrument(span),
        );
    }
}
