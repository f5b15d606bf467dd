//! Turn-taking state machine.
//!
//! The controller is the only writer of the generation counter. It advances
//! the counter when the user starts speaking over an assistant response,
//! which invalidates every frame and backend call tagged with the old value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use parley_core::token::GenerationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    /// First output of a response produced under `generation`.
    ResponseStarted { generation: u64 },
    /// The response's audio has finished playing out.
    ResponseFinished { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    UserSpeaking,
    AssistantResponding,
}

pub struct InterruptionController {
    state: TurnState,
    token: GenerationToken,
    allow_interruptions: bool,
    interruptions: Arc<AtomicU64>,
    state_tx: watch::Sender<TurnState>,
}

impl InterruptionController {
    pub fn new(token: GenerationToken, allow_interruptions: bool) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Idle);
        Self {
            state: TurnState::Idle,
            token,
            allow_interruptions,
            interruptions: Arc::new(AtomicU64::new(0)),
            state_tx,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state_tx.subscribe()
    }

    /// Shared interruption counter.
    pub fn interruption_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.interruptions)
    }

    /// Apply one event. Returns the new generation when it caused an interruption.
    pub fn handle(&mut self, event: TurnEvent) -> Option<u64> {
        let mut interrupted = None;
        let next = match (self.state, event) {
            (TurnState::Idle, TurnEvent::UserStartedSpeaking) => TurnState::UserSpeaking,
            (TurnState::UserSpeaking, TurnEvent::UserStartedSpeaking) => TurnState::UserSpeaking,
            (TurnState::AssistantResponding, TurnEvent::UserStartedSpeaking) => {
                if self.allow_interruptions {
                    let generation = self.token.advance();
                    self.interruptions.fetch_add(1, Ordering::SeqCst);
                    info!(generation, "User interrupted the assistant");
                    interrupted = Some(generation);
                    TurnState::UserSpeaking
                } else {
                    debug!("User spoke over the assistant; interruptions disabled");
                    TurnState::AssistantResponding
                }
            }
            (TurnState::UserSpeaking, TurnEvent::UserStoppedSpeaking) => TurnState::Idle,
            (
                TurnState::Idle | TurnState::UserSpeaking,
                TurnEvent::ResponseStarted { generation },
            ) if !self.token.is_stale(generation) => TurnState::AssistantResponding,
            (TurnState::AssistantResponding, TurnEvent::ResponseFinished { generation })
                if generation == self.token.current() =>
            {
                TurnState::Idle
            }
            (state, event) => {
                trace!(?state, ?event, "Turn event ignored");
                state
            }
        };

        if next != self.state {
            debug!(from = ?self.state, to = ?next, "Turn state changed");
            self.state = next;
            self.state_tx.send_replace(next);
        }
        interrupted
    }

    /// Consume events until every sender is gone or the session is cancelled.
    pub async fn run(mut self, mut events: mpsc::Receiver<TurnEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => {
                    self.handle(event);
                }
                None => break,
            }
        }
        debug!(
            interruptions = self.interruptions.load(Ordering::SeqCst),
            "Interruption controller stopped"
        );
    }
}
