//! Transport adapter: the audio-in source and audio-out sink of a pipeline.
//!
//! Wire framing lives with the connection layer; these stages only see
//! decoded [`TransportEvent`]s and produce [`OutboundEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use parley_core::error::StageError;
use parley_core::frame::{AudioChunk, ControlSignal, Frame, VoiceActivity, pcm_duration};
use parley_media::VoiceActivityDetector;

use crate::capture::{CaptureEvent, CaptureTap};
use crate::interruption::TurnEvent;
use crate::stage::{Stage, StageContext, StageEvent, StageRole};

/// Events decoded from the remote connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { session_key: String },
    /// PCM16 little-endian audio.
    Audio(Bytes),
    Disconnected,
}

/// Events to encode onto the remote connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// PCM16 little-endian audio.
    Audio(Bytes),
    /// Drop whatever the remote side has buffered for playback.
    Clear,
}

/// Source stage: turns transport events into frames and runs voice activity detection.
pub struct TransportInput {
    events: mpsc::Receiver<TransportEvent>,
    vad: VoiceActivityDetector,
    sample_rate: u32,
    channels: u16,
    capture: Option<CaptureTap>,
    connected: bool,
}

impl TransportInput {
    pub fn new(
        events: mpsc::Receiver<TransportEvent>,
        vad: VoiceActivityDetector,
        sample_rate: u32,
        channels: u16,
        capture: Option<CaptureTap>,
    ) -> Self {
        Self {
            events,
            vad,
            sample_rate,
            channels,
            capture,
            connected: false,
        }
    }

    async fn tap(&self, event: CaptureEvent) {
        if let Some(capture) = &self.capture {
            capture.send(event).await;
        }
    }

    async fn on_transport_event(
        &mut self,
        event: TransportEvent,
        ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        match event {
            TransportEvent::Connected { session_key } => {
                if self.connected {
                    warn!(session = %session_key, "Duplicate connect event ignored");
                    return Ok(());
                }
                self.connected = true;
                info!(session = %session_key, "Client connected");
                self.tap(CaptureEvent::Start {
                    session_key: session_key.clone(),
                })
                .await;
                ctx.push(Frame::Control(ControlSignal::SessionStart { session_key }))
                    .await;
            }
            TransportEvent::Audio(bytes) => {
                if bytes.is_empty() || bytes.len() % 2 != 0 {
                    return Err(StageError::MalformedFrame(format!(
                        "audio payload of {} bytes is not PCM16",
                        bytes.len()
                    )));
                }
                self.tap(CaptureEvent::Inbound(bytes.clone())).await;

                let chunk = AudioChunk::new(bytes, self.sample_rate, self.channels);
                if let Some(activity) = self.vad.process_frame(&chunk.samples()) {
                    debug!(?activity, "Voice activity");
                    ctx.push(Frame::VoiceActivity(activity)).await;
                    ctx.notify(match activity {
                        VoiceActivity::Started => TurnEvent::UserStartedSpeaking,
                        VoiceActivity::Stopped => TurnEvent::UserStoppedSpeaking,
                    })
                    .await;
                }
                ctx.push(Frame::Audio(chunk)).await;
            }
            TransportEvent::Disconnected => {
                info!("Client disconnected, cancelling session");
                self.tap(CaptureEvent::End).await;
                ctx.push(Frame::Control(ControlSignal::SessionEnd)).await;
                // Nobody is left to hear an in-flight response.
                ctx.token().cancel_session();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for TransportInput {
    fn name(&self) -> &'static str {
        "transport_input"
    }

    fn role(&self) -> StageRole {
        StageRole::Source
    }

    /// Frames queued into the head of the pipeline are forwarded as-is.
    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        ctx.push(frame).await;
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
                event = self.events.recv() => {
                    let event = event.unwrap_or(TransportEvent::Disconnected);
                    let disconnected = event == TransportEvent::Disconnected;
                    if let Err(e) = self.on_transport_event(event, ctx).await {
                        ctx.absorb(e)?;
                    }
                    if disconnected {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Sink stage: sends synthesized audio to the transport and paces playback.
///
/// Stale audio is dropped, every generation advance clears the remote
/// playback buffer, and `ResponseFinished` is reported once the audio of a
/// completed turn has had time to play out.
pub struct TransportOutput {
    outbound: mpsc::Sender<OutboundEvent>,
    capture: Option<CaptureTap>,
    sample_rate: u32,
    channels: u16,
    play_until: Option<Instant>,
    finishing: Option<u64>,
}

impl TransportOutput {
    pub fn new(
        outbound: mpsc::Sender<OutboundEvent>,
        sample_rate: u32,
        channels: u16,
        capture: Option<CaptureTap>,
    ) -> Self {
        Self {
            outbound,
            capture,
            sample_rate,
            channels,
            play_until: None,
            finishing: None,
        }
    }

    /// Hand an event to the connection writer. Gives up on cancellation.
    async fn send(&self, event: OutboundEvent, ctx: &StageContext) {
        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => {
                trace!("Session cancelled, outbound event dropped");
            }
            sent = self.outbound.send(event) => {
                if sent.is_err() {
                    trace!("Transport closed, outbound event dropped");
                }
            }
        }
    }

    async fn clear(&mut self, generation: u64, ctx: &StageContext) {
        debug!(generation, "Clearing remote playback");
        self.play_until = None;
        self.finishing = None;
        self.send(OutboundEvent::Clear, ctx).await;
    }

    fn advance_clock(&mut self, len: usize) {
        let now = Instant::now();
        let start = self.play_until.filter(|t| *t > now).unwrap_or(now);
        self.play_until = Some(start + pcm_duration(len, self.sample_rate, self.channels));
    }
}

#[async_trait]
impl Stage for TransportOutput {
    fn name(&self) -> &'static str {
        "transport_output"
    }

    fn role(&self) -> StageRole {
        StageRole::Sink
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame {
            Frame::SynthesisAudio { bytes, generation } => {
                if ctx.is_stale(generation) {
                    trace!(generation, "Dropping stale audio");
                    return Ok(());
                }
                self.advance_clock(bytes.len());
                if let Some(capture) = &self.capture {
                    capture.send(CaptureEvent::Outbound(bytes.clone())).await;
                }
                self.send(OutboundEvent::Audio(bytes), ctx).await;
            }
            Frame::Control(ControlSignal::EndOfTurn { generation }) => {
                if !ctx.is_stale(generation) {
                    self.finishing = Some(generation);
                }
                ctx.push(frame).await;
            }
            other => ctx.push(other).await,
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<(), StageError> {
        loop {
            let deadline = self.play_until.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                event = ctx.next_event(true) => match event {
                    Some(StageEvent::Generation(generation)) => self.clear(generation, ctx).await,
                    Some(StageEvent::Frame(frame)) => {
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
                _ = tokio::time::sleep_until(deadline), if self.finishing.is_some() => {
                    if let Some(generation) = self.finishing.take() {
                        self.play_until = None;
                        if !ctx.is_stale(generation) {
                            debug!(generation, "Response played out");
                            ctx.notify(TurnEvent::ResponseFinished { generation }).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::token::GenerationToken;

    struct Harness {
        head: mpsc::Sender<Frame>,
        out: mpsc::Receiver<Frame>,
        events: mpsc::Receiver<TurnEvent>,
        token: GenerationToken,
    }

    fn harness(name: &'static str) -> (Harness, StageContext) {
        let (head, in_rx) = mpsc::channel(16);
        let (out_tx, out) = mpsc::channel(16);
        let (events_tx, events) = mpsc::channel(16);
        let token = GenerationToken::new();
        let ctx = StageContext::new(name, in_rx, Some(out_tx), token.clone(), events_tx);
        (
            Harness {
                head,
                out,
                events,
                token,
            },
            ctx,
        )
    }

    fn loud(samples: usize) -> Bytes {
        std::iter::repeat(2000i16.to_le_bytes())
            .take(samples)
            .flatten()
            .collect::<Vec<u8>>()
            .into()
    }

    #[tokio::test]
    async fn test_input_emits_lifecycle_vad_and_audio() {
        let (mut h, ctx) = harness("transport_input");
        let (events_tx, events_rx) = mpsc::channel(16);
        let input = TransportInput::new(
            events_rx,
            VoiceActivityDetector::new(500.0, 1, 2),
            8000,
            1,
            None,
        );
        let worker = tokio::spawn(crate::stage::run_stage(Box::new(input), ctx));

        events_tx
            .send(TransportEvent::Connected {
                session_key: "MZ1".into(),
            })
            .await
            .unwrap();
        events_tx.send(TransportEvent::Audio(loud(160))).await.unwrap();
        events_tx.send(TransportEvent::Audio(Bytes::from_static(&[1]))).await.unwrap();
        events_tx.send(TransportEvent::Disconnected).await.unwrap();
        worker.await.unwrap().unwrap();

        assert!(matches!(
            h.out.recv().await,
            Some(Frame::Control(ControlSignal::SessionStart { session_key })) if session_key == "MZ1"
        ));
        assert!(matches!(
            h.out.recv().await,
            Some(Frame::VoiceActivity(VoiceActivity::Started))
        ));
        assert!(matches!(h.out.recv().await, Some(Frame::Audio(chunk)) if chunk.bytes.len() == 320));
        // The one-byte payload was dropped as malformed.
        assert!(matches!(
            h.out.recv().await,
            Some(Frame::Control(ControlSignal::SessionEnd))
        ));
        assert_eq!(h.events.recv().await, Some(TurnEvent::UserStartedSpeaking));
        // Disconnect cancels the session once the end has been queued.
        assert!(h.token.is_cancelled());
        drop(h.head);
    }

    #[tokio::test]
    async fn test_disconnect_flushes_capture_end_before_cancel() {
        let (h, ctx) = harness("transport_input");
        let (events_tx, events_rx) = mpsc::channel(4);
        let (tap, mut tap_rx) = CaptureTap::channel(4);
        let input = TransportInput::new(
            events_rx,
            VoiceActivityDetector::default(),
            8000,
            1,
            Some(tap),
        );
        let worker = tokio::spawn(crate::stage::run_stage(Box::new(input), ctx));

        events_tx
            .send(TransportEvent::Connected {
                session_key: "MZ2".into(),
            })
            .await
            .unwrap();
        events_tx.send(TransportEvent::Disconnected).await.unwrap();
        worker.await.unwrap().unwrap();

        assert!(h.token.is_cancelled());
        assert!(matches!(tap_rx.recv().await, Some(CaptureEvent::Start { .. })));
        assert_eq!(tap_rx.recv().await, Some(CaptureEvent::End));
    }

    #[tokio::test]
    async fn test_output_unblocks_on_cancel_when_writer_stalls() {
        let (h, ctx) = harness("transport_output");
        // Capacity one and never read: the second audio frame blocks the sink.
        let (outbound_tx, _outbound) = mpsc::channel(1);
        let output = TransportOutput::new(outbound_tx, 8000, 1, None);
        let worker = tokio::spawn(crate::stage::run_stage(Box::new(output), ctx));

        for _ in 0..3 {
            h.head
                .send(Frame::SynthesisAudio {
                    bytes: loud(8),
                    generation: 0,
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.token.cancel_session();

        let stopped = tokio::time::timeout(std::time::Duration::from_secs(2), worker).await;
        assert!(stopped.is_ok(), "sink stayed blocked after cancel");
        stopped.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_output_drops_stale_audio_and_clears() {
        let (mut h, ctx) = harness("transport_output");
        let (outbound_tx, mut outbound) = mpsc::channel(16);
        let output = TransportOutput::new(outbound_tx, 8000, 1, None);
        let worker = tokio::spawn(crate::stage::run_stage(Box::new(output), ctx));

        h.head
            .send(Frame::SynthesisAudio {
                bytes: loud(8),
                generation: 0,
            })
            .await
            .unwrap();
        assert_eq!(outbound.recv().await, Some(OutboundEvent::Audio(loud(8))));

        h.token.advance();
        assert_eq!(outbound.recv().await, Some(OutboundEvent::Clear));

        h.head
            .send(Frame::SynthesisAudio {
                bytes: loud(8),
                generation: 0,
            })
            .await
            .unwrap();
        h.head
            .send(Frame::SynthesisAudio {
                bytes: loud(4),
                generation: 1,
            })
            .await
            .unwrap();
        assert_eq!(outbound.recv().await, Some(OutboundEvent::Audio(loud(4))));

        h.head.send(Frame::Control(ControlSignal::SessionEnd)).await.unwrap();
        worker.await.unwrap().unwrap();
        assert!(matches!(
            h.out.recv().await,
            Some(Frame::Control(ControlSignal::SessionEnd))
        ));
    }

    #[tokio::test]
    async fn test_output_reports_playback_finished() {
        let (mut h, ctx) = harness("transport_output");
        let (outbound_tx, _outbound) = mpsc::channel(16);
        let output = TransportOutput::new(outbound_tx, 8000, 1, None);
        let worker = tokio::spawn(crate::stage::run_stage(Box::new(output), ctx));

        // 80 samples at 8 kHz: 10ms of audio.
        h.head
            .send(Frame::SynthesisAudio {
                bytes: loud(80),
                generation: 0,
            })
            .await
            .unwrap();
        h.head
            .send(Frame::Control(ControlSignal::EndOfTurn { generation: 0 }))
            .await
            .unwrap();

        assert_eq!(
            h.events.recv().await,
            Some(TurnEvent::ResponseFinished { generation: 0 })
        );
        assert!(matches!(
            h.out.recv().await,
            Some(Frame::Control(ControlSignal::EndOfTurn { generation: 0 }))
        ));

        h.token.cancel_session();
        worker.await.unwrap().unwrap();
    }
}
