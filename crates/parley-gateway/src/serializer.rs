//! Twilio media-stream wire format.
//!
//! Twilio sends JSON text frames tagged by `event`. Audio arrives as base64
//! μ-law at 8 kHz and is converted to PCM16 here; outbound PCM16 goes the
//! other way, addressed to the stream SID learned from the `start` event.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use parley_media::codec::{pcm16_to_ulaw, ulaw_to_pcm16};
use parley_pipeline::OutboundEvent;

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("invalid stream message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid media payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("stream has not started")]
    NotStarted,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Connected,
    Start { stream_sid: String, call_sid: String },
    /// PCM16 little-endian audio.
    Audio(Bytes),
    Mark(String),
    Dtmf(String),
    Stop,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum WireInbound {
    Connected {},
    Start {
        stream_sid: String,
        start: StartPayload,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Dtmf {
        dtmf: DtmfPayload,
    },
    Stop {},
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaFormat {
    encoding: String,
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DtmfPayload {
    digit: String,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum WireOutbound<'a> {
    Media {
        stream_sid: &'a str,
        media: OutboundMedia,
    },
    Clear {
        stream_sid: &'a str,
    },
}

#[derive(Serialize)]
struct OutboundMedia {
    payload: String,
}

/// Converts between Twilio stream messages and pipeline transport events.
#[derive(Debug, Clone, Default)]
pub struct TwilioSerializer {
    stream_sid: Option<String>,
}

impl TwilioSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializer bound to a known stream.
    pub fn for_stream(stream_sid: impl Into<String>) -> Self {
        Self {
            stream_sid: Some(stream_sid.into()),
        }
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    /// Decode one text frame. A `start` message binds the serializer to its stream.
    pub fn decode(&mut self, text: &str) -> Result<InboundEvent, SerializerError> {
        let event = match serde_json::from_str::<WireInbound>(text)? {
            WireInbound::Connected {} => InboundEvent::Connected,
            WireInbound::Start { stream_sid, start } => {
                if let Some(format) = &start.media_format {
                    tracing::debug!(
                        encoding = %format.encoding,
                        sample_rate = format.sample_rate,
                        "Stream media format"
                    );
                }
                self.stream_sid = Some(stream_sid.clone());
                InboundEvent::Start {
                    stream_sid,
                    call_sid: start.call_sid,
                }
            }
            WireInbound::Media { media } => {
                let ulaw = STANDARD.decode(media.payload)?;
                InboundEvent::Audio(Bytes::from(ulaw_to_pcm16(&ulaw)))
            }
            WireInbound::Mark { mark } => InboundEvent::Mark(mark.name),
            WireInbound::Dtmf { dtmf } => InboundEvent::Dtmf(dtmf.digit),
            WireInbound::Stop {} => InboundEvent::Stop,
        };
        Ok(event)
    }

    /// Encode a pipeline event as a text frame for the current stream.
    pub fn encode(&self, event: &OutboundEvent) -> Result<String, SerializerError> {
        let stream_sid = self.stream_sid.as_deref().ok_or(SerializerError::NotStarted)?;
        let wire = match event {
            OutboundEvent::Audio(pcm) => WireOutbound::Media {
                stream_sid,
                media: OutboundMedia {
                    payload: STANDARD.encode(pcm16_to_ulaw(pcm)),
                },
            },
            OutboundEvent::Clear => WireOutbound::Clear { stream_sid },
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_start_binds_stream() {
        let mut serializer = TwilioSerializer::new();
        let msg = json!({
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "accountSid": "AC1",
                "streamSid": "MZ123",
                "callSid": "CA9",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1},
                "customParameters": {}
            }
        });
        let event = serializer.decode(&msg.to_string()).unwrap();
        assert_eq!(
            event,
            InboundEvent::Start {
                stream_sid: "MZ123".into(),
                call_sid: "CA9".into()
            }
        );
        assert_eq!(serializer.stream_sid(), Some("MZ123"));
    }

    #[test]
    fn test_decode_media_expands_ulaw() {
        let mut serializer = TwilioSerializer::new();
        let payload = STANDARD.encode([parley_media::codec::ULAW_SILENCE; 160]);
        let msg = json!({
            "event": "media",
            "streamSid": "MZ123",
            "media": {"track": "inbound", "chunk": "1", "timestamp": "5", "payload": payload}
        });
        match serializer.decode(&msg.to_string()).unwrap() {
            InboundEvent::Audio(pcm) => {
                assert_eq!(pcm.len(), 320);
                assert!(pcm.iter().all(|b| *b == 0));
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_events() {
        let mut serializer = TwilioSerializer::new();
        assert_eq!(
            serializer
                .decode(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
                .unwrap(),
            InboundEvent::Connected
        );
        assert_eq!(
            serializer
                .decode(r#"{"event":"mark","streamSid":"MZ1","mark":{"name":"greeting"}}"#)
                .unwrap(),
            InboundEvent::Mark("greeting".into())
        );
        assert_eq!(
            serializer
                .decode(r#"{"event":"dtmf","streamSid":"MZ1","dtmf":{"track":"inbound_track","digit":"5"}}"#)
                .unwrap(),
            InboundEvent::Dtmf("5".into())
        );
        assert_eq!(
            serializer
                .decode(r#"{"event":"stop","streamSid":"MZ1","stop":{"callSid":"CA9"}}"#)
                .unwrap(),
            InboundEvent::Stop
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut serializer = TwilioSerializer::new();
        assert!(matches!(
            serializer.decode("not json"),
            Err(SerializerError::Json(_))
        ));
        assert!(matches!(
            serializer.decode(r#"{"event":"media","media":{"payload":"!!"}}"#),
            Err(SerializerError::Base64(_))
        ));
    }

    #[test]
    fn test_encode_requires_stream() {
        let serializer = TwilioSerializer::new();
        assert!(matches!(
            serializer.encode(&OutboundEvent::Clear),
            Err(SerializerError::NotStarted)
        ));
    }

    #[test]
    fn test_encode_media_and_clear() {
        let serializer = TwilioSerializer::for_stream("MZ7");
        let text = serializer
            .encode(&OutboundEvent::Audio(Bytes::from(vec![0u8; 320])))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ7");
        let ulaw = STANDARD
            .decode(value["media"]["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(ulaw.len(), 160);

        let clear: serde_json::Value =
            serde_json::from_str(&serializer.encode(&OutboundEvent::Clear).unwrap()).unwrap();
        assert_eq!(clear, json!({"event": "clear", "streamSid": "MZ7"}));
    }
}
