//! Processing stages between the transport source and sink.

mod generator;
mod passthrough;
mod synthesizer;
mod transcriber;

use std::time::Duration;

use parley_core::error::StageError;
use parley_providers::ServiceError;

pub use generator::GeneratorStage;
pub use passthrough::PassThroughStage;
pub use synthesizer::{SentenceAggregator, SynthesizerStage};
pub use transcriber::TranscriberStage;

/// Await a backend `start`, bounded by `timeout`.
pub(crate) async fn start_with_timeout<H>(
    service: &str,
    timeout: Duration,
    start: impl Future<Output = Result<H, ServiceError>>,
) -> Result<H, StageError> {
    match tokio::time::timeout(timeout, start).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(StageError::upstream(service, e)),
        Err(_) => Err(StageError::upstream(
            service,
            format!("start timed out after {}ms", timeout.as_millis()),
        )),
    }
}
