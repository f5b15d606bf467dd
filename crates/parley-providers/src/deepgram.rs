//! Deepgram live transcription over WebSocket.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, trace, warn};

use parley_core::config::ServiceConfig;

use crate::{
    ServiceError, ServiceOptions, SpeechToText, StreamHandle, TranscriptEvent, param_string,
    spawn_stream,
};

const DEEPGRAM_URL: &str = "wss://api.deepgram.com/v1/listen";
const DEFAULT_MODEL: &str = "nova-2";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub struct DeepgramStt {
    url: String,
    api_key: String,
    model: String,
    params: serde_json::Map<String, serde_json::Value>,
}

impl DeepgramStt {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEEPGRAM_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            params: serde_json::Map::new(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| ServiceError::Config("deepgram requires an API key".into()))?;
        let mut stt = Self::new(api_key);
        if let Some(url) = &config.base_url {
            stt.url = url.clone();
        }
        if let Some(model) = &config.model {
            stt.model = model.clone();
        }
        stt.params = config.options.clone();
        Ok(stt)
    }

    /// Listen URL for a session; configured and session params override the defaults.
    pub fn listen_url(&self, options: &ServiceOptions) -> Result<String, ServiceError> {
        let mut query: Vec<(String, String)> = vec![
            ("encoding".into(), "linear16".into()),
            ("sample_rate".into(), options.sample_rate.to_string()),
            ("channels".into(), options.channels.to_string()),
            ("model".into(), self.model.clone()),
            ("interim_results".into(), "true".into()),
            ("punctuate".into(), "true".into()),
        ];
        for (key, value) in options.merged_params(&self.params) {
            let value = param_string(&value);
            match query.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => query.push((key, value)),
            }
        }

        let url = reqwest::Url::parse_with_params(&self.url, &query)
            .map_err(|e| ServiceError::Config(format!("invalid deepgram url: {e}")))?;
        Ok(url.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ListenMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    channel: Option<ListenChannel>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Extract a transcript from a Deepgram message. Non-result and empty messages yield `None`.
fn parse_message(text: &str) -> Result<Option<TranscriptEvent>, ServiceError> {
    let message: ListenMessage = serde_json::from_str(text)?;
    if message.kind != "Results" {
        trace!(kind = %message.kind, "Ignoring deepgram message");
        return Ok(None);
    }
    let transcript = message
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
        .unwrap_or_default();
    if transcript.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(TranscriptEvent {
        text: transcript,
        is_final: message.is_final,
    }))
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    fn id(&self) -> &str {
        "deepgram"
    }

    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<Bytes, TranscriptEvent>, ServiceError> {
        let url = self.listen_url(options)?;
        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = tokio::time::timeout(options.timeout, connect_async(request))
            .await
            .map_err(|_| ServiceError::Timeout(options.timeout))??;
        debug!(model = %self.model, "Deepgram stream connected");

        Ok(spawn_stream(&options.session, move |mut audio, tx| async move {
            let (mut sink, mut stream) = ws.split();
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            let mut last_audio = Instant::now();
            let mut input_open = true;

            loop {
                tokio::select! {
                    chunk = audio.recv(), if input_open => match chunk {
                        Some(chunk) => {
                            last_audio = Instant::now();
                            if let Err(e) = sink.send(Message::Binary(chunk)).await {
                                let _ = tx.send(Err(e.into())).await;
                                return;
                            }
                        }
                        None => {
                            input_open = false;
                            let close = r#"{"type":"CloseStream"}"#;
                            let _ = sink.send(Message::Text(close.into())).await;
                        }
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => match parse_message(text.as_str()) {
                            Ok(Some(event)) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(%e, "Unparseable deepgram message"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            if input_open {
                                let _ = tx.send(Err(ServiceError::Closed)).await;
                            }
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    },
                    _ = keepalive.tick(), if input_open => {
                        if last_audio.elapsed() >= KEEPALIVE_INTERVAL {
                            let ping = r#"{"type":"KeepAlive"}"#;
                            let _ = sink.send(Message::Text(ping.into())).await;
                        }
                    }
                }
            }
        }))
    }
}
