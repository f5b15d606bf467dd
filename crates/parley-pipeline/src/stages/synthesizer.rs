use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use parley_core::error::StageError;
use parley_core::frame::{ControlSignal, Frame};
use parley_providers::{ServiceOptions, StreamHandle, SynthesisEvent, SynthesisInput, TextToSpeech};

use super::start_with_timeout;
use crate::stage::{Stage, StageContext, StageEvent, next_output, push_with_timeout, stream_ended};

/// Splits streamed text into sentences for synthesis.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace; whatever is
/// left when the turn ends is returned by [`SentenceAggregator::flush`].
#[derive(Debug, Default)]
pub struct SentenceAggregator {
    buffer: String,
}

impl SentenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text, returning every sentence it completed.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Take the unterminated remainder, if any.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?')
                && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
            {
                return Some(i + c.len_utf8());
            }
        }
        None
    }
}

/// Turns generated text into audio.
///
/// Deltas are synthesized sentence by sentence and forwarded for the
/// assistant aggregator. The turn's `EndOfTurn` is held back until the
/// backend has produced all of its audio.
pub struct SynthesizerStage {
    service: Arc<dyn TextToSpeech>,
    options: ServiceOptions,
    timeout: Duration,
    handle: Option<StreamHandle<SynthesisInput, SynthesisEvent>>,
    sentences: SentenceAggregator,
    turn: Option<u64>,
    spoke: bool,
    flushed: bool,
}

impl SynthesizerStage {
    pub fn new(service: Arc<dyn TextToSpeech>, options: ServiceOptions) -> Self {
        let timeout = options.timeout;
        Self {
            service,
            options,
            timeout,
            handle: None,
            sentences: SentenceAggregator::new(),
            turn: None,
            spoke: false,
            flushed: false,
        }
    }

    fn begin_turn(&mut self, generation: u64) {
        self.turn = Some(generation);
        self.spoke = false;
        self.flushed = false;
        self.sentences.clear();
    }

    fn reset(&mut self) {
        self.turn = None;
        self.spoke = false;
        self.flushed = false;
        self.sentences.clear();
    }

    async fn send(&mut self, input: SynthesisInput) -> Result<(), StageError> {
        if self.handle.is_none() {
            let handle = start_with_timeout(
                self.service.id(),
                self.timeout,
                self.service.start(&self.options),
            )
            .await?;
            debug!(service = self.service.id(), "Synthesis stream opened");
            self.handle = Some(handle);
        }
        if let Some(handle) = &self.handle {
            push_with_timeout(handle, input, self.timeout, self.service.id()).await?;
        }
        Ok(())
    }

    async fn speak(&mut self, text: &str) -> Result<(), StageError> {
        for sentence in self.sentences.push(text) {
            trace!(%sentence, "Synthesizing");
            self.spoke = true;
            self.send(SynthesisInput::Text(sentence)).await?;
        }
        Ok(())
    }

    async fn end_turn(&mut self, generation: u64, ctx: &mut StageContext) -> Result<(), StageError> {
        if self.turn != Some(generation) {
            ctx.push(Frame::Control(ControlSignal::EndOfTurn { generation })).await;
            return Ok(());
        }
        if let Some(rest) = self.sentences.flush() {
            self.spoke = true;
            self.send(SynthesisInput::Text(rest)).await?;
        }
        if self.spoke {
            self.send(SynthesisInput::Flush).await?;
            self.flushed = true;
        } else {
            // Nothing was said; there is no audio to wait for.
            self.reset();
            ctx.push(Frame::Control(ControlSignal::EndOfTurn { generation })).await;
        }
        Ok(())
    }

    fn abort_turn(&mut self, generation: u64) {
        let Some(turn) = self.turn else {
            return;
        };
        if turn < generation {
            info!(turn, generation, "Synthesis aborted");
            if let Some(handle) = self.handle.take() {
                handle.cancel();
            }
            self.reset();
        }
    }

    async fn on_output(&mut self, event: SynthesisEvent, ctx: &mut StageContext) {
        let Some(generation) = self.turn else {
            trace!("Synthesis output outside a turn dropped");
            return;
        };
        match event {
            SynthesisEvent::Audio(bytes) => {
                ctx.push(Frame::SynthesisAudio { bytes, generation }).await;
            }
            SynthesisEvent::EndOfTurn => {
                debug!(generation, "Synthesis finished");
                self.reset();
                ctx.push(Frame::Control(ControlSignal::EndOfTurn { generation })).await;
            }
        }
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.reset();
    }
}

#[async_trait]
impl Stage for SynthesizerStage {
    fn name(&self) -> &'static str {
        "synthesizer"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame {
            Frame::Control(ControlSignal::StartOfTurn { generation }) => {
                if ctx.is_stale(generation) {
                    trace!(generation, "Dropping stale turn start");
                    return Ok(());
                }
                self.begin_turn(generation);
                ctx.push(frame).await;
            }
            Frame::GenerationDelta { ref text, generation } => {
                if ctx.is_stale(generation) {
                    trace!(generation, "Dropping stale delta");
                    return Ok(());
                }
                if self.turn != Some(generation) {
                    self.begin_turn(generation);
                }
                self.speak(text).await?;
                ctx.push(frame).await;
            }
            Frame::Control(ControlSignal::EndOfTurn { generation }) => {
                if ctx.is_stale(generation) {
                    trace!(generation, "Dropping stale end of turn");
                    return Ok(());
                }
                self.end_turn(generation, ctx).await?;
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
            let accept = !(self.turn.is_some() && self.flushed);
            tokio::select! {
                biased;
                event = ctx.next_event(accept) => match event {
                    Some(StageEvent::Generation(generation)) => self.abort_turn(generation),
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
                output = next_output(&mut self.handle) => match output {
                    Some(Ok(event)) => self.on_output(event, ctx).await,
                    Some(Err(e)) => return Err(StageError::upstream(self.service.id(), e)),
                    None => {
                        self.handle = None;
                        self.reset();
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
