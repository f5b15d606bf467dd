//! Energy-based Voice Activity Detection (VAD).

use parley_core::config::VadConfig;
use parley_core::frame::VoiceActivity;

/// Voice Activity Detector using an RMS energy threshold on 16-bit PCM chunks.
///
/// Speech must persist for `start_frames` consecutive chunks before it is
/// reported, which keeps line noise and clicks from registering as barge-in.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f64,
    start_frames: usize,
    stop_frames: usize,
    speech_active: bool,
    speech_count: usize,
    silent_count: usize,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, start_frames: usize, stop_frames: usize) -> Self {
        Self {
            threshold,
            start_frames: start_frames.max(1),
            stop_frames: stop_frames.max(1),
            speech_active: false,
            speech_count: 0,
            silent_count: 0,
        }
    }

    pub fn from_config(config: &VadConfig) -> Self {
        Self::new(config.threshold, config.start_frames, config.stop_frames)
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Feed one audio chunk; returns the transition it caused, if any.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VoiceActivity> {
        let is_speech = Self::rms(pcm) > self.threshold;

        if self.speech_active {
            if is_speech {
                self.silent_count = 0;
            } else {
                self.silent_count += 1;
                if self.silent_count >= self.stop_frames {
                    self.speech_active = false;
                    self.silent_count = 0;
                    return Some(VoiceActivity::Stopped);
                }
            }
        } else if is_speech {
            self.speech_count += 1;
            if self.speech_count >= self.start_frames {
                self.speech_active = true;
                self.speech_count = 0;
                return Some(VoiceActivity::Started);
            }
        } else {
            self.speech_count = 0;
        }

        None
    }

    /// Whether speech is currently active.
    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.speech_count = 0;
        self.silent_count = 0;
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::from_config(&VadConfig::default())
    }
}
