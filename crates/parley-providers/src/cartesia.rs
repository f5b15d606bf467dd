//! Cartesia streaming synthesis over WebSocket.
//!
//! One socket per handle; each turn is a Cartesia context. Text is sent with
//! `continue: true` and the turn is closed by an empty transcript with
//! `continue: false`, after which the server answers with `done`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use parley_core::config::ServiceConfig;

use crate::{
    ServiceError, ServiceOptions, StreamHandle, SynthesisEvent, SynthesisInput, TextToSpeech,
    spawn_stream,
};

const CARTESIA_URL: &str = "wss://api.cartesia.ai/tts/websocket";
const CARTESIA_VERSION: &str = "2024-06-10";
const DEFAULT_MODEL: &str = "sonic-english";
const DEFAULT_VOICE: &str = "156fb8d2-335b-4950-9cb3-a2d33befec77";

pub struct CartesiaTts {
    url: String,
    api_key: String,
    model: String,
    params: serde_json::Map<String, serde_json::Value>,
}

impl CartesiaTts {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: CARTESIA_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            params: serde_json::Map::new(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| ServiceError::Config("cartesia requires an API key".into()))?;
        let mut tts = Self::new(api_key);
        if let Some(url) = &config.base_url {
            tts.url = url.clone();
        }
        if let Some(model) = &config.model {
            tts.model = model.clone();
        }
        tts.params = config.options.clone();
        Ok(tts)
    }

    fn socket_url(&self) -> Result<String, ServiceError> {
        let url = reqwest::Url::parse_with_params(
            &self.url,
            &[
                ("api_key", self.api_key.as_str()),
                ("cartesia_version", CARTESIA_VERSION),
            ],
        )
        .map_err(|e| ServiceError::Config(format!("invalid cartesia url: {e}")))?;
        Ok(url.to_string())
    }
}

/// Per-session request template: everything but the transcript and context.
#[derive(Debug, Clone)]
struct RequestTemplate {
    model: String,
    voice_id: String,
    language: String,
    sample_rate: u32,
    controls: serde_json::Map<String, serde_json::Value>,
}

impl RequestTemplate {
    fn new(model: &str, params: &serde_json::Map<String, serde_json::Value>, sample_rate: u32) -> Self {
        let text = |key: &str| params.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let mut controls = serde_json::Map::new();
        for key in ["speed", "emotion"] {
            if let Some(value) = params.get(key) {
                controls.insert(key.to_string(), value.clone());
            }
        }

        Self {
            model: text("model_id").unwrap_or_else(|| model.to_string()),
            voice_id: text("voice_id").unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            language: text("language").unwrap_or_else(|| "en".to_string()),
            sample_rate,
            controls,
        }
    }

    fn request(&self, context_id: &str, transcript: &str, more: bool) -> serde_json::Value {
        let mut voice = json!({ "mode": "id", "id": self.voice_id });
        if !self.controls.is_empty() {
            voice["__experimental_controls"] = serde_json::Value::Object(self.controls.clone());
        }
        json!({
            "model_id": self.model,
            "transcript": transcript,
            "continue": more,
            "context_id": context_id,
            "voice": voice,
            "language": self.language,
            "output_format": {
                "container": "raw",
                "encoding": "pcm_s16le",
                "sample_rate": self.sample_rate,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct CartesiaMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    context_id: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Audio { context_id: Option<String>, pcm: Bytes },
    Done { context_id: Option<String> },
    Error(String),
    Other,
}

fn parse_reply(text: &str) -> Result<Reply, ServiceError> {
    let message: CartesiaMessage = serde_json::from_str(text)?;
    Ok(match message.kind.as_str() {
        "chunk" => {
            let data = message.data.unwrap_or_default();
            let pcm = BASE64
                .decode(data.as_bytes())
                .map_err(|e| ServiceError::Protocol(format!("bad audio payload: {e}")))?;
            Reply::Audio {
                context_id: message.context_id,
                pcm: Bytes::from(pcm),
            }
        }
        "done" => Reply::Done {
            context_id: message.context_id,
        },
        "error" => Reply::Error(message.error.unwrap_or_else(|| "unknown error".into())),
        _ => Reply::Other,
    })
}

#[async_trait]
impl TextToSpeech for CartesiaTts {
    fn id(&self) -> &str {
        "cartesia"
    }

    async fn start(
        &self,
        options: &ServiceOptions,
    ) -> Result<StreamHandle<SynthesisInput, SynthesisEvent>, ServiceError> {
        let url = self.socket_url()?;
        let (ws, _) = tokio::time::timeout(options.timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ServiceError::Timeout(options.timeout))??;

        let template = RequestTemplate::new(&self.model, &options.merged_params(&self.params), options.sample_rate);
        debug!(model = %template.model, voice = %template.voice_id, "Cartesia stream connected");

        Ok(spawn_stream(&options.session, move |mut input, tx| async move {
            let (mut sink, mut stream) = ws.split();
            let mut context_id: Option<String> = None;

            loop {
                tokio::select! {
                    item = input.recv() => {
                        let payload = match item {
                            Some(SynthesisInput::Text(text)) => {
                                let id = context_id
                                    .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                                    .clone();
                                template.request(&id, &text, true)
                            }
                            Some(SynthesisInput::Flush) => match &context_id {
                                Some(id) => template.request(id, "", false),
                                None => {
                                    // Nothing was said this turn.
                                    if tx.send(Ok(SynthesisEvent::EndOfTurn)).await.is_err() {
                                        return;
                                    }
                                    continue;
                                }
                            },
                            None => return,
                        };
                        if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    }
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => match parse_reply(text.as_str()) {
                            Ok(Reply::Audio { context_id: ctx, pcm }) => {
                                if ctx.is_some() && ctx != context_id {
                                    trace!("Dropping audio for a finished context");
                                    continue;
                                }
                                if tx.send(Ok(SynthesisEvent::Audio(pcm))).await.is_err() {
                                    return;
                                }
                            }
                            Ok(Reply::Done { context_id: ctx }) => {
                                if ctx.is_none() || ctx == context_id {
                                    context_id = None;
                                    if tx.send(Ok(SynthesisEvent::EndOfTurn)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(Reply::Error(reason)) => {
                                let _ = tx.send(Err(ServiceError::Protocol(reason))).await;
                                return;
                            }
                            Ok(Reply::Other) => {}
                            Err(e) => warn!(%e, "Unparseable cartesia message"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = tx.send(Err(ServiceError::Closed)).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    },
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_voice_controls() {
        let mut params = serde_json::Map::new();
        params.insert("voice_id".into(), "voice-1".into());
        params.insert("speed".into(), "normal".into());
        params.insert("emotion".into(), json!(["positivity", "curiosity"]));

        let template = RequestTemplate::new(DEFAULT_MODEL, &params, 8000);
        let request = template.request("ctx-1", "Hi there.", true);

        assert_eq!(request["transcript"], "Hi there.");
        assert_eq!(request["continue"], true);
        assert_eq!(request["context_id"], "ctx-1");
        assert_eq!(request["voice"]["id"], "voice-1");
        assert_eq!(request["voice"]["__experimental_controls"]["speed"], "normal");
        assert_eq!(request["voice"]["__experimental_controls"]["emotion"][0], "positivity");
        assert_eq!(request["output_format"]["encoding"], "pcm_s16le");
        assert_eq!(request["output_format"]["sample_rate"], 8000);
    }

    #[test]
    fn test_default_voice_without_controls() {
        let template = RequestTemplate::new(DEFAULT_MODEL, &serde_json::Map::new(), 8000);
        let request = template.request("c", "", false);
        assert_eq!(request["voice"]["id"], DEFAULT_VOICE);
        assert!(request["voice"].get("__experimental_controls").is_none());
        assert_eq!(request["model_id"], DEFAULT_MODEL);
    }

    #[test]
    fn test_parse_replies() {
        let chunk = r#"{"type":"chunk","context_id":"c1","data":"AQACAA==","done":false}"#;
        assert_eq!(
            parse_reply(chunk).unwrap(),
            Reply::Audio {
                context_id: Some("c1".into()),
                pcm: Bytes::from_static(&[1, 0, 2, 0]),
            }
        );

        let done = r#"{"type":"done","context_id":"c1","done":true}"#;
        assert_eq!(
            parse_reply(done).unwrap(),
            Reply::Done {
                context_id: Some("c1".into())
            }
        );

        let error = r#"{"type":"error","error":"invalid voice"}"#;
        assert_eq!(parse_reply(error).unwrap(), Reply::Error("invalid voice".into()));
        assert!(parse_reply(r#"{"type":"chunk","data":"%%%"}"#).is_err());
    }

    #[test]
    fn test_socket_url_carries_version() {
        let url = CartesiaTts::new("secret").socket_url().unwrap();
        assert!(url.contains("api_key=secret"));
        assert!(url.contains("cartesia_version=2024-06-10"));
    }
}
