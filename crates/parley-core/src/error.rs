use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;

/// Failures raised by a pipeline stage.
///
/// `MalformedFrame` is swallowed at the stage boundary; `UpstreamUnavailable`
/// ends the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("{service} unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl StageError {
    pub fn upstream(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error invalidates the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }
}
