//! Builds the configured streaming services.

use std::sync::Arc;

use parley_core::config::{ServiceConfig, ServicesConfig};
use tracing::info;

use crate::cartesia::CartesiaTts;
use crate::chat::ChatCompletions;
use crate::deepgram::DeepgramStt;
use crate::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
use crate::{LanguageModel, ServiceError, SpeechToText, TextToSpeech};

/// The three services a session needs.
#[derive(Clone)]
pub struct ServiceRegistry {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("stt", &self.stt.id())
            .field("llm", &self.llm.id())
            .field("tts", &self.tts.id())
            .finish()
    }
}

/// Fill in `{PROVIDER}_API_KEY` when no credential source is configured.
fn with_default_key_env(mut config: ServiceConfig) -> ServiceConfig {
    if config.api_key.is_none() && config.api_key_env.is_none() {
        config.api_key_env = Some(format!("{}_API_KEY", config.provider.to_uppercase()));
    }
    config
}

impl ServiceRegistry {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self { stt, llm, tts }
    }

    /// Scripted services with empty scripts.
    pub fn scripted() -> Self {
        Self::new(
            Arc::new(ScriptedStt::new()),
            Arc::new(ScriptedLlm::new()),
            Arc::new(ScriptedTts::new()),
        )
    }

    /// Build from config. Missing sections default to Deepgram, Cerebras and Cartesia.
    pub fn from_config(config: &ServicesConfig) -> Result<Self, ServiceError> {
        let stt = with_default_key_env(
            config
                .stt
                .clone()
                .unwrap_or_else(|| ServiceConfig::new("deepgram")),
        );
        let llm = with_default_key_env(
            config
                .llm
                .clone()
                .unwrap_or_else(|| ServiceConfig::new("cerebras")),
        );
        let tts = with_default_key_env(
            config
                .tts
                .clone()
                .unwrap_or_else(|| ServiceConfig::new("cartesia")),
        );

        let stt: Arc<dyn SpeechToText> = match stt.provider.as_str() {
            "deepgram" => Arc::new(DeepgramStt::from_config(&stt)?),
            "scripted" => Arc::new(ScriptedStt::new()),
            other => {
                return Err(ServiceError::Config(format!("unknown stt provider '{other}'")));
            }
        };
        let llm: Arc<dyn LanguageModel> = match llm.provider.as_str() {
            "scripted" => Arc::new(ScriptedLlm::new()),
            _ => Arc::new(ChatCompletions::from_config(&llm)?),
        };
        let tts: Arc<dyn TextToSpeech> = match tts.provider.as_str() {
            "cartesia" => Arc::new(CartesiaTts::from_config(&tts)?),
            "scripted" => Arc::new(ScriptedTts::new()),
            other => {
                return Err(ServiceError::Config(format!("unknown tts provider '{other}'")));
            }
        };

        info!(stt = stt.id(), llm = llm.id(), tts = tts.id(), "Streaming services configured");
        Ok(Self { stt, llm, tts })
    }
}
