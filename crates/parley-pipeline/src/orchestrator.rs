//! Pipeline assembly and supervision.
//!
//! [`PipelineBuilder`] validates the stage chain and wires the bounded queues
//! between neighbours. [`Pipeline::run`] spawns one worker per stage plus the
//! interruption controller and the capture sink, and resolves once all of
//! them are done. A fatal stage error cancels the whole session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use parley_core::error::StageError;
use parley_core::frame::Frame;
use parley_core::token::GenerationToken;

use crate::capture::{AudioCaptureSink, CaptureEvent};
use crate::interruption::{InterruptionController, TurnEvent, TurnState};
use crate::stage::{Stage, StageContext, StageRole, run_stage};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline: {0}")]
    InvalidChain(String),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("pipeline already started")]
    AlreadyStarted,

    #[error("pipeline closed")]
    Closed,

    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    queue_capacity: usize,
    allow_interruptions: bool,
    token: Option<GenerationToken>,
    capture: Option<(AudioCaptureSink, mpsc::Receiver<CaptureEvent>)>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            allow_interruptions: true,
            token: None,
            capture: None,
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn allow_interruptions(mut self, allow: bool) -> Self {
        self.allow_interruptions = allow;
        self
    }

    /// Share a token created up front, e.g. with the capture sink.
    pub fn token(mut self, token: GenerationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Append a stage to the chain.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Record the session through `sink`, fed by the tap the transport stages hold.
    pub fn capture(mut self, sink: AudioCaptureSink, tap: mpsc::Receiver<CaptureEvent>) -> Self {
        self.capture = Some((sink, tap));
        self
    }

    fn validate(&self) -> Result<(), PipelineError> {
        let roles: Vec<StageRole> = self.stages.iter().map(|s| s.role()).collect();

        let sources = roles.iter().filter(|r| **r == StageRole::Source).count();
        if sources != 1 {
            return Err(PipelineError::InvalidChain(format!(
                "expected exactly one source stage, found {sources}"
            )));
        }
        if roles.first() != Some(&StageRole::Source) {
            return Err(PipelineError::InvalidChain(
                "the source stage must come first".into(),
            ));
        }

        let sinks: Vec<usize> = roles
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == StageRole::Sink)
            .map(|(i, _)| i)
            .collect();
        match sinks.as_slice() {
            [sink] if *sink >= 2 => Ok(()),
            [_] => Err(PipelineError::InvalidChain(
                "at least one stage must sit between source and sink".into(),
            )),
            _ => Err(PipelineError::InvalidChain(format!(
                "expected exactly one sink stage, found {}",
                sinks.len()
            ))),
        }
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.validate()?;

        let token = self.token.unwrap_or_default();
        let capacity = self.queue_capacity.max(1);

        let (events_tx, events_rx) = mpsc::channel(capacity);
        let controller = InterruptionController::new(token.clone(), self.allow_interruptions);
        let turn_state = controller.subscribe();
        let interruptions = controller.interruption_counter();

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.stages.len())
            .map(|_| mpsc::channel::<Frame>(capacity))
            .unzip();
        let head = senders[0].clone();
        let downstreams = senders
            .into_iter()
            .skip(1)
            .map(Some)
            .chain(std::iter::once(None));

        let stages = self
            .stages
            .into_iter()
            .zip(receivers)
            .zip(downstreams)
            .map(|((stage, inbound), downstream)| {
                let ctx = StageContext::new(
                    stage.name(),
                    inbound,
                    downstream,
                    token.clone(),
                    events_tx.clone(),
                );
                (stage, ctx)
            })
            .collect::<Vec<_>>();
        // Only the stages hold event senders, so the controller stops with them.
        drop(events_tx);

        debug!(stages = stages.len(), capacity, "Pipeline built");
        let (state, _) = watch::channel(PipelineState::Created);
        Ok(Pipeline {
            token,
            head,
            workers: Mutex::new(Some(Workers {
                stages,
                controller,
                events: events_rx,
                capture: self.capture,
            })),
            state,
            turn_state,
            interruptions,
        })
    }
}

struct Workers {
    stages: Vec<(Box<dyn Stage>, StageContext)>,
    controller: InterruptionController,
    events: mpsc::Receiver<TurnEvent>,
    capture: Option<(AudioCaptureSink, mpsc::Receiver<CaptureEvent>)>,
}

/// One session's running stage chain.
pub struct Pipeline {
    token: GenerationToken,
    head: mpsc::Sender<Frame>,
    workers: Mutex<Option<Workers>>,
    state: watch::Sender<PipelineState>,
    turn_state: watch::Receiver<TurnState>,
    interruptions: Arc<AtomicU64>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Run every worker to completion. May only be called once.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(PipelineError::AlreadyStarted)?;

        self.state.send_replace(PipelineState::Running);
        info!(stages = workers.stages.len(), "Pipeline running");

        let mut set: JoinSet<Result<(), StageError>> = JoinSet::new();
        for (stage, ctx) in workers.stages {
            set.spawn(run_stage(stage, ctx));
        }
        let controller = workers.controller;
        let events = workers.events;
        set.spawn(async move {
            controller.run(events).await;
            Ok(())
        });
        if let Some((sink, tap)) = workers.capture {
            set.spawn(async move {
                sink.run(tap).await;
                Ok(())
            });
        }

        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result.map_err(PipelineError::from),
                Err(e) => Err(PipelineError::Panicked(e.to_string())),
            };
            if let Err(e) = result {
                if failure.is_none() {
                    error!(%e, "Pipeline worker failed, cancelling session");
                    self.token.cancel_session();
                    failure = Some(e);
                }
            }
        }

        let outcome = if failure.is_some() {
            PipelineState::Failed
        } else if self.token.is_cancelled() {
            PipelineState::Cancelled
        } else {
            PipelineState::Completed
        };
        self.state.send_replace(outcome);
        info!(
            state = ?outcome,
            interruptions = self.interruptions(),
            "Pipeline finished"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel the session. Safe to call any number of times, from anywhere.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("Cancelling pipeline");
        }
        self.token.cancel_session();
    }

    /// Inject a frame at the head of the chain.
    pub async fn queue_frame(&self, frame: Frame) -> Result<(), PipelineError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(PipelineError::Closed),
            sent = self.head.send(frame) => sent.map_err(|_| PipelineError::Closed),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn turn_state(&self) -> TurnState {
        *self.turn_state.borrow()
    }

    /// Number of barge-ins so far.
    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &GenerationToken {
        &self.token
    }
}
