use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use parley_core::error::StageError;
use parley_core::frame::Frame;
use parley_providers::{ServiceOptions, SpeechToText, StreamHandle, TranscriptEvent};

use super::start_with_timeout;
use crate::stage::{Stage, StageContext, next_output, push_with_timeout, stream_ended};

/// Feeds caller audio to speech-to-text and emits transcript deltas.
///
/// Audio is consumed unless passthrough is enabled. The backend stream is
/// opened on the first audio chunk and lives for the whole session.
pub struct TranscriberStage {
    service: Arc<dyn SpeechToText>,
    options: ServiceOptions,
    timeout: Duration,
    passthrough: bool,
    handle: Option<StreamHandle<Bytes, TranscriptEvent>>,
}

impl TranscriberStage {
    pub fn new(service: Arc<dyn SpeechToText>, options: ServiceOptions) -> Self {
        let timeout = options.timeout;
        Self {
            service,
            options,
            timeout,
            passthrough: false,
            handle: None,
        }
    }

    /// Also forward audio frames downstream.
    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    async fn send_audio(&mut self, pcm: Bytes) -> Result<(), StageError> {
        if self.handle.is_none() {
            let handle = start_with_timeout(
                self.service.id(),
                self.timeout,
                self.service.start(&self.options),
            )
            .await?;
            debug!(service = self.service.id(), "Transcription stream opened");
            self.handle = Some(handle);
        }
        if let Some(handle) = &self.handle {
            push_with_timeout(handle, pcm, self.timeout, self.service.id()).await?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

#[async_trait]
impl Stage for TranscriberStage {
    fn name(&self) -> &'static str {
        "transcriber"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame {
            Frame::Audio(chunk) => {
                self.send_audio(chunk.bytes.clone()).await?;
                if self.passthrough {
                    ctx.push(Frame::Audio(chunk)).await;
                }
            }
            other => {
                if other.is_terminal() {
                    self.close();
                }
                ctx.push(other).await;
            }
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<(), StageError> {
        loop {
            tokio::select! {
                biased;
                frame = ctx.recv() => match frame {
                    Some(frame) => {
                        let terminal = frame.is_terminal();
                        if let Err(e) = self.process(frame, ctx).await {
                            ctx.absorb(e)?;
                        }
                        if terminal {
                            break;
                        }
                    }
                    None => break,
                },
                output = next_output(&mut self.handle) => match output {
                    Some(Ok(TranscriptEvent { text, is_final })) => {
                        if text.trim().is_empty() {
                            trace!(is_final, "Empty transcript ignored");
                            continue;
                        }
                        debug!(is_final, %text, "Transcript");
                        ctx.push(Frame::TranscriptDelta { text, is_final }).await;
                    }
                    Some(Err(e)) => return Err(StageError::upstream(self.service.id(), e)),
                    None => {
                        self.handle = None;
                        stream_ended(ctx, self.service.id())?;
                    }
                },
            }
        }
        Ok(())
    }

    async fn finish(&mut self, _ctx: &mut StageContext) {
        self.close();
    }
}
