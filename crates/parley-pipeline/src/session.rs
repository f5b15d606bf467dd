use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{Instrument, info_span};

use parley_core::transcript::Transcript;

use crate::orchestrator::{Pipeline, PipelineError, PipelineState};
use crate::transport::{OutboundEvent, TransportEvent};

/// One connection's pipeline plus the ends the transport talks to.
pub struct Session {
    key: String,
    pipeline: Arc<Pipeline>,
    transcript: Transcript,
    transport: mpsc::Sender<TransportEvent>,
    outbound: Option<mpsc::Receiver<OutboundEvent>>,
}

impl Session {
    pub fn new(
        key: String,
        pipeline: Pipeline,
        transcript: Transcript,
        transport: mpsc::Sender<TransportEvent>,
        outbound: mpsc::Receiver<OutboundEvent>,
    ) -> Self {
        Self {
            key,
            pipeline: Arc::new(pipeline),
            transcript,
            transport,
            outbound: Some(outbound),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Sender for decoded transport events.
    pub fn transport(&self) -> mpsc::Sender<TransportEvent> {
        self.transport.clone()
    }

    /// Receiver of events to encode onto the connection. Available once.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<OutboundEvent>> {
        self.outbound.take()
    }

    /// Run the pipeline to completion inside a span keyed by the session.
    pub async fn run(&self) -> Result<(), PipelineError> {
        self.pipeline
            .run()
            .instrument(info_span!("session", key = %self.key))
            .await
    }

    /// Run on a new task.
    pub fn spawn(&self) -> tokio::task::JoinHandle<Result<(), PipelineError>> {
        let pipeline = Arc::clone(&self.pipeline);
        let span = info_span!("session", key = %self.key);
        tokio::spawn(async move { pipeline.run().await }.instrument(span))
    }

    pub fn cancel(&self) {
        self.pipeline.cancel();
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }
}
