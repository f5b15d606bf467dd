//! Two-track session recording.

use std::time::Duration;

use parley_core::frame::pcm_duration;

use crate::wav::pcm_to_wav;

/// Inbound (user) and outbound (assistant) PCM16 tracks of one session.
///
/// The tracks share a timeline: before assistant audio is appended, the
/// outbound track is padded with silence up to the inbound length, so a
/// response lands where it was heard rather than directly after the previous one.
/// Byte counts track audio actually appended, never the padding.
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    inbound_written: usize,
    outbound_written: usize,
}

impl RecordingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_inbound(&mut self, pcm: &[u8]) {
        self.inbound.extend_from_slice(pcm);
        self.inbound_written += pcm.len();
    }

    pub fn append_outbound(&mut self, pcm: &[u8]) {
        if self.outbound.len() < self.inbound.len() {
            self.outbound.resize(self.inbound.len(), 0);
        }
        self.outbound.extend_from_slice(pcm);
        self.outbound_written += pcm.len();
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Caller audio appended so far.
    pub fn inbound_written(&self) -> usize {
        self.inbound_written
    }

    /// Assistant audio appended so far, excluding alignment silence.
    pub fn outbound_written(&self) -> usize {
        self.outbound_written
    }

    pub fn is_empty(&self) -> bool {
        self.inbound_written == 0 && self.outbound_written == 0
    }

    /// Consume the buffer into a finished recording.
    ///
    /// Both tracks are padded to the same even length, then mixed down to mono
    /// (saturating sum) or interleaved as stereo (user left, assistant right).
    pub fn finish(mut self, session_key: impl Into<String>, sample_rate: u32, channels: u16) -> Recording {
        let len = self.inbound.len().max(self.outbound.len());
        let len = len + len % 2;
        self.inbound.resize(len, 0);
        self.outbound.resize(len, 0);

        let user = to_samples(&self.inbound);
        let assistant = to_samples(&self.outbound);
        let inbound_bytes = self.inbound_written;
        let outbound_bytes = self.outbound_written;

        let (pcm, channels) = if channels >= 2 {
            let mut interleaved = Vec::with_capacity(user.len() * 2);
            for (u, a) in user.iter().zip(&assistant) {
                interleaved.push(*u);
                interleaved.push(*a);
            }
            (interleaved, 2)
        } else {
            let mixed = user
                .iter()
                .zip(&assistant)
                .map(|(u, a)| u.saturating_add(*a))
                .collect();
            (mixed, 1)
        };

        Recording {
            session_key: session_key.into(),
            sample_rate,
            channels,
            pcm,
            inbound_bytes,
            outbound_bytes,
        }
    }
}

fn to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// A finished recording, ready for upload.
#[derive(Debug, Clone)]
pub struct Recording {
    pub session_key: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Mixed or interleaved samples.
    pub pcm: Vec<i16>,
    /// Caller audio received, in PCM16 bytes.
    pub inbound_bytes: usize,
    /// Assistant audio delivered, in PCM16 bytes. Zero if the assistant never spoke.
    pub outbound_bytes: usize,
}

impl Recording {
    pub fn duration(&self) -> Duration {
        pcm_duration(self.pcm.len() * 2, self.sample_rate, self.channels)
    }

    pub fn to_wav(&self) -> Vec<u8> {
        pcm_to_wav(&self.pcm, self.sample_rate, self.channels)
    }

    /// Object key the recording is stored under.
    pub fn object_key(&self) -> String {
        let key: String = self
            .session_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{key}.wav")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_outbound_is_aligned_to_inbound() {
        let mut buffer = RecordingBuffer::new();
        buffer.append_inbound(&pcm(&[1, 2, 3, 4]));
        buffer.append_outbound(&pcm(&[9]));
        assert_eq!(buffer.outbound_len(), 10);

        let recording = buffer.finish("CA1", 8000, 2);
        assert_eq!(recording.pcm, vec![1, 0, 2, 0, 3, 0, 4, 0, 0, 9]);
        assert_eq!(recording.inbound_bytes, 8);
        assert_eq!(recording.outbound_bytes, 2);
    }

    #[test]
    fn test_mono_mix_saturates() {
        let mut buffer = RecordingBuffer::new();
        buffer.append_outbound(&pcm(&[i16::MAX, -5]));
        buffer.append_inbound(&pcm(&[100, 5]));

        let recording = buffer.finish("CA1", 8000, 1);
        assert_eq!(recording.channels, 1);
        assert_eq!(recording.pcm, vec![i16::MAX, 0]);
    }

    #[test]
    fn test_finish_pads_shorter_track() {
        let mut buffer = RecordingBuffer::new();
        buffer.append_inbound(&pcm(&[7; 160]));
        let recording = buffer.finish("CA1", 8000, 1);
        assert_eq!(recording.pcm.len(), 160);
        assert_eq!(recording.inbound_bytes, 320);
        // The silent outbound track is padding only.
        assert_eq!(recording.outbound_bytes, 0);
        assert_eq!(recording.duration().as_millis(), 20);
    }

    #[test]
    fn test_counts_exclude_padding() {
        let mut buffer = RecordingBuffer::new();
        buffer.append_inbound(&pcm(&[1; 320]));
        buffer.append_outbound(&pcm(&[2; 80]));
        buffer.append_inbound(&pcm(&[1; 160]));
        buffer.append_outbound(&pcm(&[2; 80]));
        assert_eq!(buffer.outbound_len(), 1120);
        assert_eq!(buffer.outbound_written(), 320);

        let recording = buffer.finish("CA1", 8000, 1);
        assert_eq!(recording.inbound_bytes, 960);
        assert_eq!(recording.outbound_bytes, 320);
        assert_eq!(recording.pcm.len(), 560);
    }

    #[test]
    fn test_odd_length_is_padded() {
        let mut buffer = RecordingBuffer::new();
        buffer.append_inbound(&[1, 0, 2]);
        let recording = buffer.finish("CA1", 8000, 1);
        assert_eq!(recording.pcm, vec![1, 2]);
    }

    #[test]
    fn test_object_key_is_sanitized() {
        let recording = RecordingBuffer::new().finish("MZ 12/ab", 8000, 1);
        assert_eq!(recording.object_key(), "MZ_12_ab.wav");
        assert!(recording.pcm.is_empty());
    }
}
