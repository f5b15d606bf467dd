//! Real-time voice pipeline: transport in, speech-to-text, language model,
//! text-to-speech, transport out, with barge-in and session recording.

pub mod aggregator;
pub mod capture;
pub mod interruption;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod stage;
pub mod stages;
pub mod transport;

pub use capture::{AudioCaptureSink, CaptureEvent, CaptureTap};
pub use interruption::{InterruptionController, TurnEvent, TurnState};
pub use orchestrator::{Pipeline, PipelineBuilder, PipelineError, PipelineState};
pub use pool::{ComponentPool, PipelineSettings};
pub use session::Session;
pub use stage::{Stage, StageContext, StageEvent, StageRole};
pub use transport::{OutboundEvent, TransportEvent, TransportInput, TransportOutput};
