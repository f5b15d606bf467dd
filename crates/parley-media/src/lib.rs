//! Media handling: μ-law codec, voice activity detection, WAV container,
//! session recording and recording upload.

pub mod codec;
pub mod recording;
pub mod upload;
pub mod vad;
pub mod wav;

pub use recording::{Recording, RecordingBuffer};
pub use upload::{FileUploader, HttpUploader, StorageError, Uploader};
pub use vad::VoiceActivityDetector;
