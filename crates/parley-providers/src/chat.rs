//! OpenAI-compatible streaming chat completions.
//!
//! Serves Cerebras, OpenAI, Groq, Ollama and any other endpoint that speaks
//! `/v1/chat/completions` with `stream: true`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::config::ServiceConfig;
use parley_core::transcript::Message;

use crate::sse::parse_sse_stream;
use crate::{GenerationEvent, LanguageModel, ServiceError, ServiceOptions, StreamHandle, spawn_stream};

const CEREBRAS_BASE_URL: &str = "https://api.cerebras.ai";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Default model per preset.
fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4o-mini",
        "groq" => "llama-3.3-70b-versatile",
        "ollama" => "llama3.2",
        _ => "llama-4-scout-17b-16e-instruct",
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletions {
    provider_id: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    params: serde_json::Map<String, serde_json::Value>,
    client: reqwest::Client,
}

impl ChatCompletions {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            params: serde_json::Map::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let base_url = match (config.base_url.as_deref(), config.provider.as_str()) {
            (Some(url), _) => url,
            (None, "cerebras") => CEREBRAS_BASE_URL,
            (None, "openai") => OPENAI_BASE_URL,
            (None, "groq") => GROQ_BASE_URL,
            (None, "ollama") => OLLAMA_BASE_URL,
            (None, other) => {
                return Err(ServiceError::Config(format!(
                    "provider '{other}' needs a base_url"
                )));
            }
        };
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| default_model(&config.provider).to_string());

        let mut chat = Self::new(&config.provider, base_url, model, config.resolve_api_key());
        chat.params = config.options.clone();
        Ok(chat)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(
        &self,
        messages: &[Message],
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: true,
            extra: params.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    /// Pass-through sampling options (temperature, max_tokens, ...).
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text carried by one SSE data payload, or `None` for `[DONE]`.
fn parse_chunk(data: &str) -> Result<Option<String>, ServiceError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    Ok(Some(
        chunk
            .choices
            .into_iter()
            .filter_map(|c| c.delta.content)
            .collect(),
    ))
}

#[async_trait]
impl LanguageModel for ChatCompletions {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<Vec<Message>, GenerationEvent>, ServiceError> {
        let this = self.clone();
        let params = options.merged_params(&self.params);
        let timeout = options.timeout;

        Ok(spawn_stream(&options.session, move |mut contexts: mpsc::Receiver<Vec<Message>>, tx| async move {
            while let Some(messages) = contexts.recv().await {
                let body = this.build_request(&messages, &params);
                debug!(model = %body.model, base_url = %this.base_url, messages = messages.len(), "Streaming chat completion");

                let mut request = this
                    .client
                    .post(format!("{}/v1/chat/completions", this.base_url))
                    .header("content-type", "application/json")
                    .json(&body);
                if let Some(key) = &this.api_key {
                    request = request.bearer_auth(key);
                }

                let response = match tokio::time::timeout(timeout, request.send()).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        let _ = tx.send(Err(ServiceError::Http(e))).await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx.send(Err(ServiceError::Timeout(timeout))).await;
                        return;
                    }
                };

                if !response.status().is_success() {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let _ = tx
                        .send(Err(ServiceError::Protocol(format!("{status}: {text}"))))
                        .await;
                    return;
                }

                let mut events = Box::pin(parse_sse_stream(response));
                loop {
                    let event = match tokio::time::timeout(timeout, events.next()).await {
                        Ok(Some(Ok(event))) => event,
                        Ok(Some(Err(e))) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            let _ = tx.send(Err(ServiceError::Timeout(timeout))).await;
                            return;
                        }
                    };
                    match parse_chunk(&event.data) {
                        Ok(Some(text)) if text.is_empty() => {}
                        Ok(Some(text)) => {
                            if tx.send(Ok(GenerationEvent::Delta(text))).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => trace!(%e, data = %event.data, "Skipping unparseable chunk"),
                    }
                }

                if tx.send(Ok(GenerationEvent::EndOfTurn)).await.is_err() {
                    return;
                }
            }
        }))
    }
}
