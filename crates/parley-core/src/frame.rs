//! Frame model, the unit of data passed between pipeline stages.

use std::time::Instant;

use bytes::Bytes;

use crate::transcript::Message;

/// A chunk of raw PCM16 little-endian audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: Instant,
}

impl AudioChunk {
    pub fn new(bytes: impl Into<Bytes>, sample_rate: u32, channels: u16) -> Self {
        Self {
            bytes: bytes.into(),
            sample_rate,
            channels,
            timestamp: Instant::now(),
        }
    }

    /// Decode the payload into 16-bit samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> Vec<i16> {
        self.bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Playback duration of this chunk.
    pub fn duration(&self) -> std::time::Duration {
        pcm_duration(self.bytes.len(), self.sample_rate, self.channels)
    }
}

/// Playback duration of `len` bytes of PCM16 audio.
pub fn pcm_duration(len: usize, sample_rate: u32, channels: u16) -> std::time::Duration {
    let frames_per_sec = sample_rate as u64 * channels.max(1) as u64 * 2;
    if frames_per_sec == 0 {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::from_micros(len as u64 * 1_000_000 / frames_per_sec)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// The remote participant connected; carries the opaque session key.
    SessionStart { session_key: String },
    StartOfTurn { generation: u64 },
    EndOfTurn { generation: u64 },
    Cancel,
    SessionEnd,
}

/// Transcript snapshot handed to the generation stage.
#[derive(Debug, Clone)]
pub struct ContextFrame {
    pub messages: Vec<Message>,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioChunk),
    TranscriptDelta { text: String, is_final: bool },
    Context(ContextFrame),
    GenerationDelta { text: String, generation: u64 },
    SynthesisAudio { bytes: Bytes, generation: u64 },
    VoiceActivity(VoiceActivity),
    Control(ControlSignal),
}

impl Frame {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Audio(_) => "audio",
            Frame::TranscriptDelta { .. } => "transcript_delta",
            Frame::Context(_) => "context",
            Frame::GenerationDelta { .. } => "generation_delta",
            Frame::SynthesisAudio { .. } => "synthesis_audio",
            Frame::VoiceActivity(_) => "voice_activity",
            Frame::Control(_) => "control",
        }
    }

    /// Generation tag carried by this frame, if any.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Frame::Context(ctx) => Some(ctx.generation),
            Frame::GenerationDelta { generation, .. }
            | Frame::SynthesisAudio { generation, .. }
            | Frame::Control(ControlSignal::StartOfTurn { generation })
            | Frame::Control(ControlSignal::EndOfTurn { generation }) => Some(*generation),
            _ => None,
        }
    }

    /// Whether a stage should stop after forwarding this frame.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::Control(ControlSignal::SessionEnd) | Frame::Control(ControlSignal::Cancel)
        )
    }
}
