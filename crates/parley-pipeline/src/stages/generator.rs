use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use parley_core::error::StageError;
use parley_core::frame::{ContextFrame, ControlSignal, Frame};
use parley_core::transcript::Message;
use parley_providers::{GenerationEvent, LanguageModel, ServiceOptions, StreamHandle};

use super::start_with_timeout;
use crate::interruption::TurnEvent;
use crate::stage::{Stage, StageContext, StageEvent, next_output, push_with_timeout, stream_ended};

/// Runs the language model on each `Context` frame.
///
/// One turn is in flight at a time; further frames wait in the inbound
/// queue until it ends. A generation advance aborts the backend call and
/// nothing more is emitted for the old turn.
pub struct GeneratorStage {
    service: Arc<dyn LanguageModel>,
    options: ServiceOptions,
    timeout: Duration,
    handle: Option<StreamHandle<Vec<Message>, GenerationEvent>>,
    turn: Option<u64>,
    responding: bool,
}

impl GeneratorStage {
    pub fn new(service: Arc<dyn LanguageModel>, options: ServiceOptions) -> Self {
        let timeout = options.timeout;
        Self {
            service,
            options,
            timeout,
            handle: None,
            turn: None,
            responding: false,
        }
    }

    async fn begin_turn(&mut self, context: ContextFrame, ctx: &mut StageContext) -> Result<(), StageError> {
        let generation = context.generation;
        if ctx.is_stale(generation) {
            trace!(generation, "Dropping stale context");
            return Ok(());
        }

        if self.handle.is_none() {
            let handle = start_with_timeout(
                self.service.id(),
                self.timeout,
                self.service.start(&self.options),
            )
            .await?;
            debug!(service = self.service.id(), "Generation stream opened");
            self.handle = Some(handle);
        }
        if let Some(handle) = &self.handle {
            push_with_timeout(handle, context.messages, self.timeout, self.service.id()).await?;
        }

        debug!(generation, "Generation started");
        self.turn = Some(generation);
        self.responding = false;
        ctx.push(Frame::Control(ControlSignal::StartOfTurn { generation })).await;
        Ok(())
    }

    fn abort_turn(&mut self, generation: u64) {
        let Some(turn) = self.turn else {
            return;
        };
        if turn < generation {
            info!(turn, generation, "Generation aborted");
            if let Some(handle) = self.handle.take() {
                handle.cancel();
            }
            self.turn = None;
            self.responding = false;
        }
    }

    async fn on_output(&mut self, event: GenerationEvent, ctx: &mut StageContext) {
        let Some(generation) = self.turn else {
            trace!(?event, "Generation output outside a turn dropped");
            return;
        };
        match event {
            GenerationEvent::Delta(text) => {
                if !self.responding {
                    self.responding = true;
                    ctx.notify(TurnEvent::ResponseStarted { generation }).await;
                }
                ctx.push(Frame::GenerationDelta { text, generation }).await;
            }
            GenerationEvent::EndOfTurn => {
                debug!(generation, "Generation finished");
                self.turn = None;
                self.responding = false;
                ctx.push(Frame::Control(ControlSignal::EndOfTurn { generation })).await;
            }
        }
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.turn = None;
    }
}

#[async_trait]
impl Stage for GeneratorStage {
    fn name(&self) -> &'static str {
        "generator"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame {
            Frame::Context(context) => self.begin_turn(context, ctx).await?,
            // The user's end of turn is superseded by the context that follows it.
            Frame::Control(ControlSignal::EndOfTurn { .. }) => {}
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
            let idle = self.turn.is_none();
            tokio::select! {
                biased;
                event = ctx.next_event(idle) => match event {
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
                        self.turn = None;
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
