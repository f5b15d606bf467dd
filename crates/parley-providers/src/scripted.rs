//! Deterministic in-process services for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use parley_core::transcript::Message;

use crate::{
    GenerationEvent, LanguageModel, ServiceError, ServiceOptions, SpeechToText, StreamHandle,
    SynthesisEvent, SynthesisInput, TextToSpeech, TranscriptEvent, spawn_stream,
};

/// Emits scripted utterances after a given number of audio chunks.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStt {
    utterances: Vec<(usize, String)>,
    fail_after: Option<usize>,
    received: Arc<AtomicUsize>,
}

impl ScriptedStt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalize `text` once `chunks` more audio chunks have arrived.
    pub fn utterance_after(mut self, chunks: usize, text: impl Into<String>) -> Self {
        self.utterances.push((chunks, text.into()));
        self
    }

    /// Drop the stream after `chunks` audio chunks, as a lost connection would.
    pub fn fail_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Audio chunks received across all streams.
    pub fn received_chunks(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<Bytes, TranscriptEvent>, ServiceError> {
        let mut script: VecDeque<(usize, String)> = self.utterances.iter().cloned().collect();
        let fail_after = self.fail_after;
        let received = Arc::clone(&self.received);

        Ok(spawn_stream(&options.session, move |mut audio, tx| async move {
            let mut total = 0usize;
            let mut since_last = 0usize;
            while audio.recv().await.is_some() {
                received.fetch_add(1, Ordering::SeqCst);
                total += 1;
                since_last += 1;

                if fail_after.is_some_and(|n| total >= n) {
                    let _ = tx.send(Err(ServiceError::Closed)).await;
                    return;
                }

                let due = script.front().is_some_and(|(after, _)| since_last >= *after);
                if !due {
                    continue;
                }
                if let Some((_, text)) = script.pop_front() {
                    since_last = 0;
                    let interim = text.split_whitespace().next().unwrap_or_default().to_string();
                    let events = [
                        TranscriptEvent {
                            text: interim,
                            is_final: false,
                        },
                        TranscriptEvent {
                            text,
                            is_final: true,
                        },
                    ];
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }))
    }
}

/// Replies with queued responses, one per pushed context.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm {
    responses: Arc<Mutex<VecDeque<Vec<String>>>>,
    delta_delay: Duration,
    contexts: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the deltas of one response.
    pub fn respond(self, deltas: &[&str]) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(deltas.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Pause before each delta.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = delay;
        self
    }

    /// Contexts received so far, in order.
    pub fn contexts(&self) -> Vec<Vec<Message>> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<Vec<Message>, GenerationEvent>, ServiceError> {
        let this = self.clone();

        Ok(spawn_stream(&options.session, move |mut input, tx| async move {
            while let Some(messages) = input.recv().await {
                this.contexts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(messages);
                let deltas = this
                    .responses
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front()
                    .unwrap_or_else(|| vec!["OK.".to_string()]);

                for delta in deltas {
                    if !this.delta_delay.is_zero() {
                        tokio::time::sleep(this.delta_delay).await;
                    }
                    if tx.send(Ok(GenerationEvent::Delta(delta))).await.is_err() {
                        return;
                    }
                }
                if tx.send(Ok(GenerationEvent::EndOfTurn)).await.is_err() {
                    return;
                }
            }
        }))
    }
}

/// Produces a fixed amount of non-silent audio per text segment.
#[derive(Debug, Clone)]
pub struct ScriptedTts {
    chunks_per_text: usize,
    chunk_bytes: usize,
    chunk_delay: Duration,
    texts: Arc<Mutex<Vec<String>>>,
}

impl Default for ScriptedTts {
    fn default() -> Self {
        Self {
            chunks_per_text: 2,
            chunk_bytes: 320,
            chunk_delay: Duration::ZERO,
            texts: Arc::default(),
        }
    }
}

impl ScriptedTts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(mut self, chunks_per_text: usize, chunk_bytes: usize) -> Self {
        self.chunks_per_text = chunks_per_text;
        self.chunk_bytes = chunk_bytes;
        self
    }

    /// Pause before each audio chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Text segments received so far.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<SynthesisInput, SynthesisEvent>, ServiceError> {
        let this = self.clone();
        let chunk: Bytes = std::iter::repeat([0xE8u8, 0x03]) // 1000
            .take(this.chunk_bytes / 2)
            .flatten()
            .collect::<Vec<u8>>()
            .into();

        Ok(spawn_stream(&options.session, move |mut input, tx| async move {
            while let Some(item) = input.recv().await {
                match item {
                    SynthesisInput::Text(text) => {
                        this.texts
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(text);
                        for _ in 0..this.chunks_per_text {
                            if !this.chunk_delay.is_zero() {
                                tokio::time::sleep(this.chunk_delay).await;
                            }
                            if tx.send(Ok(SynthesisEvent::Audio(chunk.clone()))).await.is_err() {
                                return;
                            }
                        }
                    }
                    SynthesisInput::Flush => {
                        if tx.send(Ok(SynthesisEvent::EndOfTurn)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stt_emits_interim_then_final() {
        let stt = ScriptedStt::new().utterance_after(2, "hello there");
        let mut handle = stt.start(&ServiceOptions::default()).await.unwrap();

        handle.push(Bytes::from_static(&[0, 0])).await.unwrap();
        handle.push(Bytes::from_static(&[0, 0])).await.unwrap();

        let interim = handle.next().await.unwrap().unwrap();
        assert_eq!(interim.text, "hello");
        assert!(!interim.is_final);
        let final_event = handle.next().await.unwrap().unwrap();
        assert_eq!(final_event.text, "hello there");
        assert!(final_event.is_final);
        assert_eq!(stt.received_chunks(), 2);
    }

    #[tokio::test]
    async fn test_scripted_stt_failure() {
        let stt = ScriptedStt::new().fail_after(1);
        let mut handle = stt.start(&ServiceOptions::default()).await.unwrap();
        handle.push(Bytes::from_static(&[0, 0])).await.unwrap();
        assert!(matches!(handle.next().await, Some(Err(ServiceError::Closed))));
    }

    #[tokio::test]
    async fn test_scripted_llm_turns() {
        let llm = ScriptedLlm::new().respond(&["Hi ", "there."]);
        let mut handle = llm.start(&ServiceOptions::default()).await.unwrap();
        handle
            .push(vec![Message::new(parley_core::transcript::Role::User, "hello")])
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(Ok(event)) = handle.next().await {
            let end = event == GenerationEvent::EndOfTurn;
            events.push(event);
            if end {
                break;
            }
        }
        assert_eq!(
            events,
            vec![
                GenerationEvent::Delta("Hi ".into()),
                GenerationEvent::Delta("there.".into()),
                GenerationEvent::EndOfTurn,
            ]
        );
        assert_eq!(llm.contexts().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_tts_audio_then_end_of_turn() {
        let tts = ScriptedTts::new().with_chunks(3, 160);
        let mut handle = tts.start(&ServiceOptions::default()).await.unwrap();
        handle.push(SynthesisInput::Text("Hi there.".into())).await.unwrap();
        handle.push(SynthesisInput::Flush).await.unwrap();

        for _ in 0..3 {
            match handle.next().await {
                Some(Ok(SynthesisEvent::Audio(pcm))) => assert_eq!(pcm.len(), 160),
                other => panic!("expected audio, got {other:?}"),
            }
        }
        assert!(matches!(handle.next().await, Some(Ok(SynthesisEvent::EndOfTurn))));
        assert_eq!(tts.texts(), vec!["Hi there.".to_string()]);
    }
}
