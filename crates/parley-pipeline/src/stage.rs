//! Stage abstraction and the per-stage runtime context.
//!
//! Every stage runs on its own task and owns the receiving end of a bounded
//! queue from its upstream neighbour. Frames it does not consume are forwarded
//! unchanged and in order. Session cancellation is surfaced to the stage as a
//! single synthetic `Control(Cancel)` frame, after which its inbound queue
//! reads as closed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, error, info_span, trace, warn};

use parley_core::error::StageError;
use parley_core::frame::{ControlSignal, Frame};
use parley_core::token::GenerationToken;
use parley_providers::{ServiceError, StreamHandle};

use crate::interruption::TurnEvent;

/// Position a stage may occupy in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Produces frames from the transport; must be first.
    Source,
    Processor,
    /// Delivers frames back to the transport.
    Sink,
}

/// What woke a stage up.
#[derive(Debug)]
pub enum StageEvent {
    Frame(Frame),
    /// The generation counter advanced to this value.
    Generation(u64),
}

#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    fn role(&self) -> StageRole {
        StageRole::Processor
    }

    /// Handle one inbound frame, pushing zero or more frames downstream.
    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError>;

    /// Main loop. Stages that also wait on a backend override this.
    async fn run(&mut self, ctx: &mut StageContext) -> Result<(), StageError> {
        while let Some(frame) = ctx.recv().await {
            let terminal = frame.is_terminal();
            if let Err(e) = self.process(frame, ctx).await {
                ctx.absorb(e)?;
            }
            if terminal {
                break;
            }
        }
        Ok(())
    }

    /// Called once the loop has ended, whatever the reason.
    async fn finish(&mut self, _ctx: &mut StageContext) {}
}

/// Channels and shared state a stage works with.
pub struct StageContext {
    name: &'static str,
    inbound: mpsc::Receiver<Frame>,
    downstream: Option<mpsc::Sender<Frame>>,
    token: GenerationToken,
    generation: watch::Receiver<u64>,
    events: mpsc::Sender<TurnEvent>,
    cancel_delivered: bool,
}

impl StageContext {
    pub fn new(
        name: &'static str,
        inbound: mpsc::Receiver<Frame>,
        downstream: Option<mpsc::Sender<Frame>>,
        token: GenerationToken,
        events: mpsc::Sender<TurnEvent>,
    ) -> Self {
        let generation = token.subscribe();
        Self {
            name,
            inbound,
            downstream,
            token,
            generation,
            events,
            cancel_delivered: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn token(&self) -> &GenerationToken {
        &self.token
    }

    pub fn current_generation(&self) -> u64 {
        self.token.current()
    }

    pub fn is_stale(&self, generation: u64) -> bool {
        self.token.is_stale(generation)
    }

    /// Next inbound frame. Cancellation takes priority over queued frames.
    pub async fn recv(&mut self) -> Option<Frame> {
        if self.cancel_delivered {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.cancel_delivered = true;
                Some(Frame::Control(ControlSignal::Cancel))
            }
            frame = self.inbound.recv() => frame,
        }
    }

    /// Wait for cancellation, a generation advance or (when `accept_frames`) a frame.
    pub async fn next_event(&mut self, accept_frames: bool) -> Option<StageEvent> {
        if self.cancel_delivered {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.cancel_delivered = true;
                Some(StageEvent::Frame(Frame::Control(ControlSignal::Cancel)))
            }
            changed = self.generation.changed() => match changed {
                Ok(()) => Some(StageEvent::Generation(*self.generation.borrow_and_update())),
                Err(_) => None,
            },
            frame = self.inbound.recv(), if accept_frames => frame.map(StageEvent::Frame),
        }
    }

    /// Push a frame downstream. Gives up on cancellation or a closed consumer.
    pub async fn push(&self, frame: Frame) {
        let Some(downstream) = &self.downstream else {
            return;
        };
        let kind = frame.kind();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                trace!(stage = self.name, kind, "Push abandoned, session cancelled");
            }
            sent = downstream.send(frame) => {
                if sent.is_err() {
                    trace!(stage = self.name, kind, "Downstream closed");
                }
            }
        }
    }

    /// Report turn progress to the interruption controller.
    pub async fn notify(&self, event: TurnEvent) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            sent = self.events.send(event) => {
                if sent.is_err() {
                    trace!(stage = self.name, "Interruption controller gone");
                }
            }
        }
    }

    /// Swallow recoverable errors with a diagnostic; hand fatal ones back.
    pub fn absorb(&self, error: StageError) -> Result<(), StageError> {
        match error {
            StageError::MalformedFrame(reason) => {
                warn!(stage = self.name, %reason, "Dropping malformed frame");
                Ok(())
            }
            fatal => Err(fatal),
        }
    }
}

/// Drive a stage to completion inside its own span.
pub async fn run_stage(mut stage: Box<dyn Stage>, mut ctx: StageContext) -> Result<(), StageError> {
    let span = info_span!("stage", stage = stage.name());
    async move {
        debug!("Stage started");
        let result = stage.run(&mut ctx).await;
        stage.finish(&mut ctx).await;
        match &result {
            Ok(()) => debug!("Stage finished"),
            Err(e) => error!(%e, "Stage failed"),
        }
        result
    }
    .instrument(span)
    .await
}

/// Next backend output, or pending forever when no stream is open.
pub(crate) async fn next_output<I, O>(
    handle: &mut Option<StreamHandle<I, O>>,
) -> Option<Result<O, ServiceError>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    match handle {
        Some(handle) => handle.next().await,
        None => std::future::pending().await,
    }
}

/// Push into a backend, turning a stall or a dropped stream into `UpstreamUnavailable`.
pub(crate) async fn push_with_timeout<I, O>(
    handle: &StreamHandle<I, O>,
    item: I,
    timeout: Duration,
    service: &str,
) -> Result<(), StageError>
where
    I: Send + 'static,
    O: Send + 'static,
{
    match tokio::time::timeout(timeout, handle.push(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StageError::upstream(service, e)),
        Err(_) => Err(StageError::upstream(
            service,
            format!("push timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Map the end of a backend stream: expected after cancellation, fatal otherwise.
pub(crate) fn stream_ended(ctx: &StageContext, service: &str) -> Result<(), StageError> {
    if ctx.token().is_cancelled() {
        Ok(())
    } else {
        Err(StageError::upstream(service, "stream closed"))
    }
}
