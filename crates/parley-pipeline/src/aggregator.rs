//! Context aggregators: the only writers of the session transcript.

use async_trait::async_trait;
use tracing::{debug, trace};

use parley_core::error::StageError;
use parley_core::frame::{ContextFrame, ControlSignal, Frame};
use parley_core::transcript::{Role, Transcript};

use crate::stage::{Stage, StageContext, StageEvent};

/// Appends finalized user utterances and requests a response for each.
pub struct UserAggregator {
    transcript: Transcript,
    greeting: Option<String>,
    interim: String,
}

impl UserAggregator {
    pub fn new(transcript: Transcript, greeting: Option<String>) -> Self {
        Self {
            transcript,
            greeting,
            interim: String::new(),
        }
    }

    async fn request_response(&self, ctx: &mut StageContext) {
        let generation = ctx.current_generation();
        ctx.push(Frame::Context(ContextFrame {
            messages: self.transcript.snapshot(),
            generation,
        }))
        .await;
    }
}

#[async_trait]
impl Stage for UserAggregator {
    fn name(&self) -> &'static str {
        "user_aggregator"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame {
            Frame::TranscriptDelta {
                text,
                is_final: false,
            } => {
                trace!(%text, "Interim transcript");
                self.interim = text;
            }
            Frame::TranscriptDelta {
                text,
                is_final: true,
            } => {
                self.interim.clear();
                let text = text.trim();
                if text.is_empty() {
                    return Ok(());
                }
                debug!(%text, "User turn");
                self.transcript.append(Role::User, text);
                let generation = ctx.current_generation();
                ctx.push(Frame::Control(ControlSignal::EndOfTurn { generation }))
                    .await;
                self.request_response(ctx).await;
            }
            Frame::Control(ControlSignal::SessionStart { .. }) => {
                ctx.push(frame).await;
                if let Some(greeting) = &self.greeting {
                    debug!("Requesting greeting");
                    self.transcript.append(Role::System, greeting.as_str());
                    self.request_response(ctx).await;
                }
            }
            other => {
                if other.is_terminal() && !self.interim.is_empty() {
                    debug!(interim = %self.interim, "Unfinalized utterance dropped");
                }
                ctx.push(other).await;
            }
        }
        Ok(())
    }
}

/// Commits assistant responses that completed without interruption.
pub struct AssistantAggregator {
    transcript: Transcript,
    pending: Option<(u64, String)>,
}

impl AssistantAggregator {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            pending: None,
        }
    }

    fn discard_before(&mut self, generation: u64) {
        if self.pending.as_ref().is_some_and(|(g, _)| *g < generation) {
            debug!(generation, "Discarding interrupted response");
            self.pending = None;
        }
    }
}

#[async_trait]
impl Stage for AssistantAggregator {
    fn name(&self) -> &'static str {
        "assistant_aggregator"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame {
            Frame::Control(ControlSignal::StartOfTurn { generation }) => {
                self.pending = Some((generation, String::new()));
            }
            Frame::GenerationDelta { text, generation } => {
                if ctx.is_stale(generation) {
                    trace!(generation, "Dropping stale delta");
                    return Ok(());
                }
                match &mut self.pending {
                    Some((g, buffer)) if *g == generation => buffer.push_str(&text),
                    _ => self.pending = Some((generation, text)),
                }
            }
            Frame::Control(ControlSignal::EndOfTurn { generation }) => {
                let Some((g, buffer)) = self.pending.take() else {
                    return Ok(());
                };
                if g != generation || ctx.is_stale(g) {
                    trace!(generation, "End of turn for a discarded response");
                    return Ok(());
                }
                let text = buffer.trim();
                if !text.is_empty() {
                    debug!(generation, "Assistant turn committed");
                    self.transcript.append(Role::Assistant, text);
                }
            }
            other => {
                if other.is_terminal() && self.pending.take().is_some() {
                    debug!("Unfinished response discarded");
                }
                ctx.push(other).await;
            }
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<(), StageError> {
        while let Some(event) = ctx.next_event(true).await {
            match event {
                StageEvent::Generation(generation) => self.discard_before(generation),
                StageEvent::Frame(frame) => {
                    let terminal = frame.is_terminal();
                    if let Err(e) = self.process(frame, ctx).await {
                        ctx.absorb(e)?;
                    }
                    if terminal {
                        break;
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
    use tokio::sync::mpsc;

    fn final_text(text: &str) -> Frame {
        Frame::TranscriptDelta {
            text: text.into(),
            is_final: true,
        }
    }

    #[tokio::test]
    async fn test_user_final_appends_and_requests_context() {
        let transcript = Transcript::new("be brief");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out) = mpsc::channel(8);
        let (events_tx, _events) = mpsc::channel(8);
        let ctx = StageContext::new("user_aggregator", in_rx, Some(out_tx), GenerationToken::new(), events_tx);
        let stage = UserAggregator::new(transcript.clone(), None);

        in_tx
            .send(Frame::TranscriptDelta {
                text: "hel".into(),
                is_final: false,
            })
            .await
            .unwrap();
        in_tx.send(final_text("  ")).await.unwrap();
        in_tx.send(final_text("hello")).await.unwrap();
        in_tx.send(Frame::Control(ControlSignal::SessionEnd)).await.unwrap();
        crate::stage::run_stage(Box::new(stage), ctx).await.unwrap();

        assert!(matches!(
            out.recv().await,
            Some(Frame::Control(ControlSignal::EndOfTurn { generation: 0 }))
        ));
        match out.recv().await {
            Some(Frame::Context(context)) => {
                assert_eq!(context.generation, 0);
                assert_eq!(context.messages.len(), 2);
                assert_eq!(context.messages[1].content, "hello");
            }
            other => panic!("expected context, got {other:?}"),
        }
        assert_eq!(transcript.count(Role::User), 1);
    }

    #[tokio::test]
    async fn test_greeting_on_session_start() {
        let transcript = Transcript::new("be brief");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out) = mpsc::channel(8);
        let (events_tx, _events) = mpsc::channel(8);
        let ctx = StageContext::new("user_aggregator", in_rx, Some(out_tx), GenerationToken::new(), events_tx);
        let stage = UserAggregator::new(transcript.clone(), Some("Say hello.".into()));

        in_tx
            .send(Frame::Control(ControlSignal::SessionStart {
                session_key: "MZ1".into(),
            }))
            .await
            .unwrap();
        in_tx.send(Frame::Control(ControlSignal::SessionEnd)).await.unwrap();
        crate::stage::run_stage(Box::new(stage), ctx).await.unwrap();

        assert!(matches!(
            out.recv().await,
            Some(Frame::Control(ControlSignal::SessionStart { .. }))
        ));
        assert!(matches!(out.recv().await, Some(Frame::Context(_))));
        assert_eq!(transcript.count(Role::System), 2);
    }

    #[tokio::test]
    async fn test_assistant_commits_only_completed_turns() {
        let transcript = Transcript::new("be brief");
        let token = GenerationToken::new();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (events_tx, _events) = mpsc::channel(8);
        let ctx = StageContext::new("assistant_aggregator", in_rx, None, token.clone(), events_tx);
        let worker = tokio::spawn(crate::stage::run_stage(
            Box::new(AssistantAggregator::new(transcript.clone())),
            ctx,
        ));

        for frame in [
            Frame::Control(ControlSignal::StartOfTurn { generation: 0 }),
            Frame::GenerationDelta {
                text: "Hi ".into(),
                generation: 0,
            },
            Frame::GenerationDelta {
                text: "there.".into(),
                generation: 0,
            },
            Frame::Control(ControlSignal::EndOfTurn { generation: 0 }),
            Frame::Control(ControlSignal::StartOfTurn { generation: 0 }),
            Frame::GenerationDelta {
                text: "Let me".into(),
                generation: 0,
            },
        ] {
            in_tx.send(frame).await.unwrap();
        }
        // Interrupted before its end of turn.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.advance();
        in_tx
            .send(Frame::Control(ControlSignal::EndOfTurn { generation: 0 }))
            .await
            .unwrap();
        in_tx.send(Frame::Control(ControlSignal::SessionEnd)).await.unwrap();
        worker.await.unwrap().unwrap();

        let entries = transcript.entries();
        let assistant: Vec<_> = entries
            .iter()
            .filter(|e| e.message.role == Role::Assistant)
            .map(|e| e.message.content.as_str())
            .collect();
        assert_eq!(assistant, vec!["Hi there."]);
    }
}
