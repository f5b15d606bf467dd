//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default system prompt when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. Your output is \
converted to audio, so speak the way a person would on the phone. Use short sentences and \
appropriate punctuation so the speech has natural emotion. Do not use lists or markdown.";

/// Default instruction appended when the caller connects, so the assistant speaks first.
pub const DEFAULT_GREETING: &str =
    "Please introduce yourself to the user and ask how you can help them.";

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Public `wss://` URL of the media-stream endpoint, used in the TwiML answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// How long a disconnected session may drain before it is cancelled (default: 5000).
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,

    /// How long to wait for the stream `start` message (default: 10000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            public_url: None,
            teardown_grace_ms: default_teardown_grace_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

fn default_port() -> u16 {
    8765
}

fn default_teardown_grace_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Sample rate of the audio on both directions of the wire (default: 8000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    /// Channel count of inbound audio (default: 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,

    /// Capacity of every stage-to-stage queue (default: 64).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    /// Let user speech interrupt the assistant (default: true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_interruptions: Option<bool>,

    /// Forward inbound audio past the transcriber (default: false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_passthrough: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Instruction added when the caller connects. Empty string disables the greeting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,

    /// Timeout for connecting to and pushing into external services (default: 5000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_timeout_ms: Option<u64>,

    #[serde(default)]
    pub vad: VadConfig,
}

/// Energy-based voice activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// RMS threshold above which a chunk counts as speech (default: 500.0).
    #[serde(default = "default_vad_threshold")]
    pub threshold: f64,

    /// Consecutive speech chunks before speech is reported as started (default: 3).
    #[serde(default = "default_vad_start_frames")]
    pub start_frames: usize,

    /// Consecutive silent chunks before speech is reported as stopped (default: 15).
    #[serde(default = "default_vad_stop_frames")]
    pub stop_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            start_frames: default_vad_start_frames(),
            stop_frames: default_vad_stop_frames(),
        }
    }
}

fn default_vad_threshold() -> f64 {
    500.0
}

fn default_vad_start_frames() -> usize {
    3
}

fn default_vad_stop_frames() -> usize {
    15
}

// --- Streaming services ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<ServiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<ServiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<ServiceConfig>,
}

/// Configuration for one streaming backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Backend id, e.g. "deepgram", "cerebras", "openai", "cartesia".
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Flat named options passed through to the backend unmodified.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: None,
            options: serde_json::Map::new(),
        }
    }

    /// Resolve the API key: check `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    /// Whether this backend needs credentials at all.
    pub fn needs_api_key(&self) -> bool {
        !matches!(self.provider.as_str(), "scripted" | "ollama")
    }
}

// --- Recording ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bucket the recording is uploaded into (default: "recordings").
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// 1 = user and assistant mixed, 2 = user left / assistant right (default: 1).
    #[serde(default = "default_recording_channels")]
    pub channels: u16,

    /// Uploader backend: "file" (default) or "http".
    #[serde(default = "default_uploader")]
    pub uploader: String,

    /// Root directory for the file uploader (default: `~/.parley/recordings`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Base URL for the http uploader; objects are PUT to `{endpoint}/{bucket}/{key}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: default_bucket(),
            channels: default_recording_channels(),
            uploader: default_uploader(),
            dir: None,
            endpoint: None,
            token: None,
            token_env: None,
        }
    }
}

impl RecordingConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    pub fn dir(&self) -> PathBuf {
        self.dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("recordings"))
    }
}

fn default_true() -> bool {
    true
}

fn default_bucket() -> String {
    "recordings".into()
}

fn default_recording_channels() -> u16 {
    1
}

fn default_uploader() -> String {
    "file".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| crate::error::ParleyError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8765)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn teardown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.gateway
                .as_ref()
                .map(|g| g.teardown_grace_ms)
                .unwrap_or_else(default_teardown_grace_ms),
        )
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.gateway
                .as_ref()
                .map(|g| g.handshake_timeout_ms)
                .unwrap_or_else(default_handshake_timeout_ms),
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.pipeline
            .as_ref()
            .and_then(|p| p.sample_rate)
            .unwrap_or(8000)
    }

    pub fn channels(&self) -> u16 {
        self.pipeline
            .as_ref()
            .and_then(|p| p.channels)
            .unwrap_or(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.pipeline
            .as_ref()
            .and_then(|p| p.queue_capacity)
            .unwrap_or(64)
    }

    pub fn allow_interruptions(&self) -> bool {
        self.pipeline
            .as_ref()
            .and_then(|p| p.allow_interruptions)
            .unwrap_or(true)
    }

    pub fn audio_passthrough(&self) -> bool {
        self.pipeline
            .as_ref()
            .and_then(|p| p.audio_passthrough)
            .unwrap_or(false)
    }

    pub fn system_prompt(&self) -> String {
        self.pipeline
            .as_ref()
            .and_then(|p| p.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    /// Greeting instruction, or `None` when disabled with an empty string.
    pub fn greeting(&self) -> Option<String> {
        match self.pipeline.as_ref().and_then(|p| p.greeting.clone()) {
            Some(g) if g.trim().is_empty() => None,
            Some(g) => Some(g),
            None => Some(DEFAULT_GREETING.to_string()),
        }
    }

    pub fn service_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.pipeline
                .as_ref()
                .and_then(|p| p.service_timeout_ms)
                .unwrap_or(5_000),
        )
    }

    pub fn vad(&self) -> VadConfig {
        self.pipeline
            .as_ref()
            .map(|p| p.vad.clone())
            .unwrap_or_default()
    }

    pub fn recording(&self) -> RecordingConfig {
        self.recording.clone().unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "services.tts.options.speed").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let services = self.services.clone().unwrap_or_default();
        for (kind, svc) in [("stt", &services.stt), ("llm", &services.llm), ("tts", &services.tts)] {
            match svc {
                None => warnings.push(format!("No {kind} service configured")),
                Some(s) if s.needs_api_key() && s.resolve_api_key().is_none() => {
                    warnings.push(format!(
                        "Service '{}' ({kind}) has no API key configured",
                        s.provider
                    ));
                }
                Some(_) => {}
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if self.sample_rate() == 0 {
            errors.push("pipeline.sample_rate cannot be 0".to_string());
        }
        if self.channels() == 0 {
            errors.push("pipeline.channels cannot be 0".to_string());
        }
        if self.queue_capacity() == 0 {
            errors.push("pipeline.queue_capacity cannot be 0".to_string());
        }

        let recording = self.recording();
        if recording.enabled {
            if !matches!(recording.channels, 1 | 2) {
                errors.push(format!(
                    "recording.channels must be 1 or 2, got {}",
                    recording.channels
                ));
            }
            match recording.uploader.as_str() {
                "file" => {}
                "http" if recording.endpoint.is_none() => {
                    errors.push("recording.endpoint is required for the http uploader".to_string());
                }
                "http" => {}
                other => errors.push(format!("Unknown recording uploader: {other}")),
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
