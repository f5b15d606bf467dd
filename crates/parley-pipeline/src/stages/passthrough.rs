use async_trait::async_trait;
use tracing::trace;

use parley_core::error::StageError;
use parley_core::frame::Frame;

use crate::stage::{Stage, StageContext};

/// Forwards every frame unchanged, tracing each one.
#[derive(Debug, Default)]
pub struct PassThroughStage {
    forwarded: u64,
}

impl PassThroughStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for PassThroughStage {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        self.forwarded += 1;
        trace!(kind = frame.kind(), generation = ?frame.generation(), "Frame");
        ctx.push(frame).await;
        Ok(())
    }

    async fn finish(&mut self, _ctx: &mut StageContext) {
        trace!(forwarded = self.forwarded, "Pass-through drained");
    }
}
