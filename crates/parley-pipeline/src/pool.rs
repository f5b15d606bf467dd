//! Process-wide components shared by every session.
//!
//! Streaming service clients and the recording uploader are built once,
//! either eagerly through [`ComponentPool::prepare`] or on first use, and
//! handed to each new session. Recording uploads run on the pool's task
//! tracker so shutdown can wait for them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OnceCell, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use parley_core::config::{Config, RecordingConfig, ServicesConfig, VadConfig};
use parley_core::error::{ParleyError, Result};
use parley_core::token::GenerationToken;
use parley_core::transcript::Transcript;
use parley_media::{Uploader, VoiceActivityDetector, upload};
use parley_providers::{ServiceOptions, ServiceRegistry};

use crate::aggregator::{AssistantAggregator, UserAggregator};
use crate::capture::{AudioCaptureSink, CaptureTap};
use crate::orchestrator::PipelineBuilder;
use crate::session::Session;
use crate::stages::{GeneratorStage, SynthesizerStage, TranscriberStage};
use crate::transport::{TransportInput, TransportOutput};

/// Everything a session needs from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub queue_capacity: usize,
    pub allow_interruptions: bool,
    pub audio_passthrough: bool,
    pub system_prompt: String,
    pub greeting: Option<String>,
    pub service_timeout: Duration,
    pub vad: VadConfig,
    pub services: ServicesConfig,
    pub recording: RecordingConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_rate: config.sample_rate(),
            channels: config.channels(),
            queue_capacity: config.queue_capacity(),
            allow_interruptions: config.allow_interruptions(),
            audio_passthrough: config.audio_passthrough(),
            system_prompt: config.system_prompt(),
            greeting: config.greeting(),
            service_timeout: config.service_timeout(),
            vad: config.vad(),
            services: config.services.clone().unwrap_or_default(),
            recording: config.recording(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ComponentPool {
    settings: PipelineSettings,
    services: OnceCell<ServiceRegistry>,
    uploader: OnceCell<Option<Arc<dyn Uploader>>>,
    tracker: TaskTracker,
}

impl ComponentPool {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            services: OnceCell::new(),
            uploader: OnceCell::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Pool with ready-made components instead of configured ones.
    pub fn with_components(
        settings: PipelineSettings,
        services: ServiceRegistry,
        uploader: Option<Arc<dyn Uploader>>,
    ) -> Self {
        Self {
            settings,
            services: OnceCell::new_with(Some(services)),
            uploader: OnceCell::new_with(Some(uploader)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Build every shared component now rather than on the first call.
    pub async fn prepare(&self) -> Result<()> {
        let services = self.services().await?;
        let uploader = self.uploader().await?;
        info!(
            stt = services.stt.id(),
            llm = services.llm.id(),
            tts = services.tts.id(),
            uploader = uploader.as_ref().map(|u| u.name()).unwrap_or("disabled"),
            "Component pool ready"
        );
        Ok(())
    }

    async fn services(&self) -> Result<&ServiceRegistry> {
        self.services
            .get_or_try_init(|| async {
                ServiceRegistry::from_config(&self.settings.services)
                    .map_err(|e| ParleyError::Config(e.to_string()))
            })
            .await
    }

    async fn uploader(&self) -> Result<Option<Arc<dyn Uploader>>> {
        self.uploader
            .get_or_try_init(|| async {
                if !self.settings.recording.enabled {
                    debug!("Recording disabled");
                    return Ok(None);
                }
                upload::from_config(&self.settings.recording)
                    .map(Some)
                    .map_err(|e| ParleyError::Storage(e.to_string()))
            })
            .await
            .cloned()
    }

    /// Assemble the pipeline for one connection.
    pub async fn session(&self, session_key: impl Into<String>) -> Result<Session> {
        let session_key = session_key.into();
        let services = self.services().await?.clone();
        let uploader = self.uploader().await?;
        let s = &self.settings;

        let token = GenerationToken::new();
        let transcript = Transcript::new(s.system_prompt.clone());
        let (transport_tx, transport_rx) = mpsc::channel(s.queue_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(s.queue_capacity.max(1));
        let options = ServiceOptions {
            sample_rate: s.sample_rate,
            channels: s.channels,
            timeout: s.service_timeout,
            session: token.child_token(),
            params: serde_json::Map::new(),
        };

        let (tap, capture) = match uploader {
            Some(uploader) => {
                let (tap, tap_rx) = CaptureTap::channel(s.queue_capacity.max(1) * 4);
                let sink = AudioCaptureSink::new(
                    uploader,
                    s.recording.bucket.clone(),
                    s.sample_rate,
                    s.recording.channels,
                    token.clone(),
                    self.tracker.clone(),
                );
                (Some(tap), Some((sink, tap_rx)))
            }
            None => (None, None),
        };

        let mut builder = PipelineBuilder::new()
            .queue_capacity(s.queue_capacity)
            .allow_interruptions(s.allow_interruptions)
            .token(token)
            .stage(TransportInput::new(
                transport_rx,
                VoiceActivityDetector::from_config(&s.vad),
                s.sample_rate,
                s.channels,
                tap.clone(),
            ))
            .stage(
                TranscriberStage::new(services.stt, options.clone())
                    .with_passthrough(s.audio_passthrough),
            )
            .stage(UserAggregator::new(transcript.clone(), s.greeting.clone()))
            .stage(GeneratorStage::new(services.llm, options.clone()))
            .stage(SynthesizerStage::new(services.tts, options))
            .stage(TransportOutput::new(outbound_tx, s.sample_rate, s.channels, tap))
            .stage(AssistantAggregator::new(transcript.clone()));
        if let Some((sink, tap_rx)) = capture {
            builder = builder.capture(sink, tap_rx);
        }

        let pipeline = builder
            .build()
            .map_err(|e| ParleyError::Pipeline(e.to_string()))?;
        debug!(session = %session_key, "Session assembled");
        Ok(Session::new(
            session_key,
            pipeline,
            transcript,
            transport_tx,
            outbound_rx,
        ))
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Wait for outstanding uploads. No new ones are accepted afterwards.
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(pending = self.tracker.len(), "Waiting for recording uploads");
        }
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::config::{PipelineConfig, ServiceConfig};

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            pipeline: Some(PipelineConfig {
                sample_rate: Some(16_000),
                greeting: Some(String::new()),
                ..PipelineConfig::default()
            }),
            ..Config::default()
        };
        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.sample_rate, 16_000);
        assert_eq!(settings.queue_capacity, 64);
        assert!(settings.greeting.is_none());
        assert!(settings.allow_interruptions);
    }

    #[tokio::test]
    async fn test_prepare_with_scripted_services() {
        let mut settings = PipelineSettings::default();
        settings.services = ServicesConfig {
            stt: Some(ServiceConfig::new("scripted")),
            llm: Some(ServiceConfig::new("scripted")),
            tts: Some(ServiceConfig::new("scripted")),
        };
        settings.recording.enabled = false;

        let pool = ComponentPool::new(settings);
        pool.prepare().await.unwrap();
        let session = pool.session("MZ1").await.unwrap();
        assert_eq!(session.key(), "MZ1");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_prepare_reports_bad_provider() {
        let mut settings = PipelineSettings::default();
        settings.services.stt = Some(ServiceConfig::new("nope"));
        let pool = ComponentPool::new(settings);
        assert!(matches!(pool.prepare().await, Err(ParleyError::Config(_))));
    }
}
