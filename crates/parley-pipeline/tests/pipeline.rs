//! End-to-end session tests with scripted services.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use parley_core::error::StageError;
use parley_core::frame::{ControlSignal, Frame};
use parley_core::transcript::Role;
use parley_media::{Recording, StorageError, Uploader, VoiceActivityDetector};
use parley_pipeline::stages::PassThroughStage;
use parley_pipeline::{
    ComponentPool, OutboundEvent, PipelineBuilder, PipelineError, PipelineSettings,
    PipelineState, Session, Stage, StageContext, TransportEvent, TransportInput,
    TransportOutput, TurnState,
};
use parley_providers::ServiceRegistry;
use parley_providers::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};

#[derive(Default)]
struct MemoryUploader {
    uploads: Mutex<Vec<Recording>>,
}

impl MemoryUploader {
    fn uploads(&self) -> Vec<Recording> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for MemoryUploader {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(&self, recording: Recording, bucket: &str) -> Result<String, StorageError> {
        let location = format!("mem://{bucket}/{}", recording.object_key());
        self.uploads.lock().unwrap().push(recording);
        Ok(location)
    }
}

/// Rejects every upload, counting the attempts.
#[derive(Default)]
struct FailingUploader {
    attempts: AtomicUsize,
}

#[async_trait]
impl Uploader for FailingUploader {
    fn name(&self) -> &str {
        "failing"
    }

    async fn upload(&self, _recording: Recording, _bucket: &str) -> Result<String, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Rejected {
            status: 503,
            body: "unavailable".into(),
        })
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        greeting: None,
        ..PipelineSettings::default()
    }
}

fn pool(
    settings: PipelineSettings,
    stt: &ScriptedStt,
    llm: &ScriptedLlm,
    tts: &ScriptedTts,
    uploader: Arc<dyn Uploader>,
) -> ComponentPool {
    let services = ServiceRegistry::new(
        Arc::new(stt.clone()),
        Arc::new(llm.clone()),
        Arc::new(tts.clone()),
    );
    ComponentPool::with_components(settings, services, Some(uploader))
}

/// 20ms of 8 kHz PCM16 at a constant level.
fn chunk(level: i16) -> Bytes {
    std::iter::repeat(level.to_le_bytes())
        .take(160)
        .flatten()
        .collect::<Vec<u8>>()
        .into()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn drain_outbound(session: &mut Session) -> tokio::task::JoinHandle<Vec<OutboundEvent>> {
    let mut outbound = session.take_outbound().unwrap();
    tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = outbound.recv().await {
            events.push(event);
        }
        events
    })
}

fn audio_bytes(events: &[OutboundEvent]) -> usize {
    events
        .iter()
        .map(|e| match e {
            OutboundEvent::Audio(pcm) => pcm.len(),
            OutboundEvent::Clear => 0,
        })
        .sum()
}

async fn connect(transport: &mpsc::Sender<TransportEvent>, key: &str) {
    transport
        .send(TransportEvent::Connected {
            session_key: key.into(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_hello_round_trip_records_once() {
    let stt = ScriptedStt::new().utterance_after(5, "hello");
    let llm = ScriptedLlm::new().respond(&["Hi ", "there."]);
    let tts = ScriptedTts::new();
    let uploader = Arc::new(MemoryUploader::default());
    let pool = pool(settings(), &stt, &llm, &tts, uploader.clone());

    let mut session = pool.session("MZhello").await.unwrap();
    let outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();

    connect(&transport, "MZhello").await;
    for _ in 0..5 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }

    let transcript = session.transcript().clone();
    eventually("assistant reply", || transcript.count(Role::Assistant) == 1).await;
    eventually("playback to finish", || {
        session.pipeline().turn_state() == TurnState::Idle
    })
    .await;

    transport.send(TransportEvent::Disconnected).await.unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(session.state(), PipelineState::Cancelled);

    let entries = transcript.entries();
    let turns: Vec<(Role, &str)> = entries
        .iter()
        .map(|e| (e.message.role, e.message.content.as_str()))
        .collect();
    assert_eq!(turns[1..], [(Role::User, "hello"), (Role::Assistant, "Hi there.")]);
    assert_eq!(tts.texts(), vec!["Hi there.".to_string()]);

    let events = outbound.await.unwrap();
    assert_eq!(audio_bytes(&events), 640);
    assert!(!events.contains(&OutboundEvent::Clear));

    pool.shutdown().await;
    let uploads = uploader.uploads();
    assert_eq!(uploads.len(), 1);
    let recording = &uploads[0];
    assert_eq!(recording.session_key, "MZhello");
    assert_eq!(recording.inbound_bytes, 5 * 320);
    assert_eq!(recording.outbound_bytes, 640);
    // The reply overlaps the end of the call.
    assert!(recording.to_wav().len() > 44 + 1600);
}

#[tokio::test]
async fn test_disconnect_abandons_in_flight_response() {
    let stt = ScriptedStt::new().utterance_after(3, "tell me a story");
    let llm = ScriptedLlm::new()
        .respond(&[
            "Once upon a time. ",
            "There was a fox. ",
            "It ran far away. ",
            "The end.",
        ])
        .with_delay(Duration::from_millis(100));
    let tts = ScriptedTts::new();
    let uploader = Arc::new(MemoryUploader::default());
    let pool = pool(settings(), &stt, &llm, &tts, uploader.clone());

    let mut session = pool.session("MZhangup").await.unwrap();
    let _outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();
    let pipeline = Arc::clone(session.pipeline());

    connect(&transport, "MZhangup").await;
    for _ in 0..3 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }
    eventually("assistant to respond", || {
        pipeline.turn_state() == TurnState::AssistantResponding
    })
    .await;

    transport.send(TransportEvent::Disconnected).await.unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(1), runner).await;
    assert!(finished.is_ok(), "session kept running after hang-up");
    finished.unwrap().unwrap().unwrap();
    assert_eq!(session.state(), PipelineState::Cancelled);

    // The rest of the story is never generated, spoken or committed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!tts.texts().contains(&"The end.".to_string()));
    assert_eq!(session.transcript().count(Role::Assistant), 0);
    assert_eq!(session.transcript().count(Role::User), 1);

    pool.shutdown().await;
    assert_eq!(uploader.uploads().len(), 1);
}

#[tokio::test]
async fn test_failed_upload_does_not_affect_session() {
    let stt = ScriptedStt::new();
    let llm = ScriptedLlm::new();
    let tts = ScriptedTts::new();
    let uploader = Arc::new(FailingUploader::default());
    let pool = pool(settings(), &stt, &llm, &tts, uploader.clone());

    let mut session = pool.session("MZstore").await.unwrap();
    let _outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();

    connect(&transport, "MZstore").await;
    for _ in 0..2 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }
    eventually("audio to reach the transcriber", || stt.received_chunks() == 2).await;
    session
        .pipeline()
        .queue_frame(Frame::Control(ControlSignal::SessionEnd))
        .await
        .unwrap();

    assert!(runner.await.unwrap().is_ok());
    assert_eq!(session.state(), PipelineState::Completed);

    pool.shutdown().await;
    assert_eq!(uploader.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_greeting_speaks_first() {
    let stt = ScriptedStt::new();
    let llm = ScriptedLlm::new().respond(&["Hello, how can I help?"]);
    let tts = ScriptedTts::new();
    let uploader = Arc::new(MemoryUploader::default());
    let pool = pool(
        PipelineSettings {
            greeting: Some("Greet the caller.".into()),
            ..PipelineSettings::default()
        },
        &stt,
        &llm,
        &tts,
        uploader.clone(),
    );

    let mut session = pool.session("MZgreet").await.unwrap();
    let _outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();
    connect(&transport, "MZgreet").await;

    let transcript = session.transcript().clone();
    eventually("greeting", || transcript.count(Role::Assistant) == 1).await;
    let context = &llm.contexts()[0];
    assert_eq!(context.last().unwrap().role, Role::System);
    assert_eq!(context.last().unwrap().content, "Greet the caller.");

    transport.send(TransportEvent::Disconnected).await.unwrap();
    runner.await.unwrap().unwrap();
    pool.shutdown().await;
    assert_eq!(uploader.uploads().len(), 1);
}

#[tokio::test]
async fn test_barge_in_discards_interrupted_turn() {
    let stt = ScriptedStt::new()
        .utterance_after(3, "tell me a story")
        .utterance_after(5, "stop");
    let llm = ScriptedLlm::new()
        .respond(&[
            "Once upon a time. ",
            "There was a fox. ",
            "It ran far away. ",
            "The end.",
        ])
        .respond(&["Okay."])
        .with_delay(Duration::from_millis(40));
    let tts = ScriptedTts::new();
    let uploader = Arc::new(MemoryUploader::default());
    let pool = pool(settings(), &stt, &llm, &tts, uploader.clone());

    let mut session = pool.session("MZbarge").await.unwrap();
    let outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();
    let pipeline = Arc::clone(session.pipeline());

    connect(&transport, "MZbarge").await;
    for _ in 0..3 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }
    eventually("assistant to respond", || {
        pipeline.turn_state() == TurnState::AssistantResponding
    })
    .await;

    // Three loud chunks start speech and interrupt the story.
    for _ in 0..3 {
        transport.send(TransportEvent::Audio(chunk(4000))).await.unwrap();
    }
    eventually("interruption", || pipeline.interruptions() == 1).await;
    for _ in 0..2 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }

    let transcript = session.transcript().clone();
    eventually("reply to the interruption", || {
        transcript.count(Role::Assistant) == 1
    })
    .await;

    transport.send(TransportEvent::Disconnected).await.unwrap();
    runner.await.unwrap().unwrap();

    let assistant: Vec<String> = transcript
        .entries()
        .into_iter()
        .filter(|e| e.message.role == Role::Assistant)
        .map(|e| e.message.content)
        .collect();
    assert_eq!(assistant, vec!["Okay.".to_string()]);
    assert_eq!(transcript.count(Role::User), 2);
    assert_eq!(pipeline.token().current(), 1);
    assert!(!tts.texts().contains(&"The end.".to_string()));

    let events = outbound.await.unwrap();
    assert!(events.contains(&OutboundEvent::Clear));
    // The reply's audio arrives after the clear.
    let clear_at = events
        .iter()
        .position(|e| *e == OutboundEvent::Clear)
        .unwrap();
    assert_eq!(audio_bytes(&events[clear_at..]), 640);

    pool.shutdown().await;
    assert_eq!(uploader.uploads().len(), 1);
}

#[tokio::test]
async fn test_cancel_twice_flushes_recording_once() {
    let stt = ScriptedStt::new();
    let llm = ScriptedLlm::new();
    let tts = ScriptedTts::new();
    let uploader = Arc::new(MemoryUploader::default());
    let pool = pool(settings(), &stt, &llm, &tts, uploader.clone());

    let mut session = pool.session("MZcancel").await.unwrap();
    let _outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();

    connect(&transport, "MZcancel").await;
    for _ in 0..2 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }
    eventually("audio to reach the transcriber", || stt.received_chunks() == 2).await;

    session.cancel();
    session.cancel();
    runner.await.unwrap().unwrap();
    session.cancel();
    assert_eq!(session.state(), PipelineState::Cancelled);

    pool.shutdown().await;
    let uploads = uploader.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].session_key, "MZcancel");
    assert_eq!(uploads[0].inbound_bytes, 640);
}

#[tokio::test]
async fn test_upstream_failure_fails_session_and_flushes() {
    let stt = ScriptedStt::new().fail_after(2);
    let llm = ScriptedLlm::new();
    let tts = ScriptedTts::new();
    let uploader = Arc::new(MemoryUploader::default());
    let pool = pool(settings(), &stt, &llm, &tts, uploader.clone());

    let mut session = pool.session("MZfail").await.unwrap();
    let _outbound = drain_outbound(&mut session);
    let transport = session.transport();
    let runner = session.spawn();

    connect(&transport, "MZfail").await;
    for _ in 0..2 {
        transport.send(TransportEvent::Audio(chunk(0))).await.unwrap();
    }

    let result = runner.await.unwrap();
    assert!(matches!(
        result,
        Err(PipelineError::Stage(StageError::UpstreamUnavailable { .. }))
    ));
    assert_eq!(session.state(), PipelineState::Failed);

    pool.shutdown().await;
    assert_eq!(uploader.uploads().len(), 1);
}

/// Records every frame that reaches the end of the chain.
struct Collector(Arc<Mutex<Vec<Frame>>>);

#[async_trait]
impl Stage for Collector {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn process(&mut self, frame: Frame, _ctx: &mut StageContext) -> Result<(), StageError> {
        self.0.lock().unwrap().push(frame);
        Ok(())
    }
}

#[tokio::test]
async fn test_frames_arrive_in_order() {
    let (_transport, transport_rx) = mpsc::channel(4);
    let (outbound_tx, _outbound) = mpsc::channel(4);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = PipelineBuilder::new()
        .queue_capacity(2)
        .stage(TransportInput::new(
            transport_rx,
            VoiceActivityDetector::default(),
            8000,
            1,
            None,
        ))
        .stage(PassThroughStage::new())
        .stage(PassThroughStage::new())
        .stage(TransportOutput::new(outbound_tx, 8000, 1, None))
        .stage(Collector(Arc::clone(&seen)))
        .build()
        .unwrap();
    let pipeline = Arc::new(pipeline);
    let runner = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run().await })
    };

    for i in 0..100u32 {
        pipeline
            .queue_frame(Frame::TranscriptDelta {
                text: i.to_string(),
                is_final: false,
            })
            .await
            .unwrap();
    }
    pipeline
        .queue_frame(Frame::Control(ControlSignal::SessionEnd))
        .await
        .unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Completed);

    let seen = seen.lock().unwrap();
    let texts: Vec<String> = seen
        .iter()
        .filter_map(|f| match f {
            Frame::TranscriptDelta { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect();
    let expected: Vec<String> = (0..100u32).map(|i| i.to_string()).collect();
    assert_eq!(texts, expected);
    assert!(matches!(
        seen.last(),
        Some(Frame::Control(ControlSignal::SessionEnd))
    ));
}

#[tokio::test]
async fn test_cancel_unblocks_run_with_stalled_writer() {
    let (_transport, transport_rx) = mpsc::channel(4);
    // Never drained, so the sink blocks on its second delivery.
    let (outbound_tx, _outbound) = mpsc::channel(1);
    let pipeline = PipelineBuilder::new()
        .stage(TransportInput::new(
            transport_rx,
            VoiceActivityDetector::default(),
            8000,
            1,
            None,
        ))
        .stage(PassThroughStage::new())
        .stage(TransportOutput::new(outbound_tx, 8000, 1, None))
        .build()
        .unwrap();
    let pipeline = Arc::new(pipeline);
    let runner = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run().await })
    };

    for _ in 0..3 {
        pipeline
            .queue_frame(Frame::SynthesisAudio {
                bytes: chunk(100),
                generation: 0,
            })
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.cancel();

    let finished = tokio::time::timeout(Duration::from_secs(2), runner).await;
    assert!(finished.is_ok(), "run() stayed blocked after cancel");
    finished.unwrap().unwrap().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Cancelled);
}

#[test]
fn test_builder_rejects_missing_sink() {
    let (_transport, transport_rx) = mpsc::channel(1);
    let result = PipelineBuilder::new()
        .stage(TransportInput::new(
            transport_rx,
            VoiceActivityDetector::default(),
            8000,
            1,
            None,
        ))
        .stage(PassThroughStage::new())
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidChain(_))));
}
