//! # Live Protocol Messages
//!
//! Message shapes exchanged with the hosted live backend.
//!
//! ## Outbound (client -> server):
//! ```json
//! { "setup": { "model": "...", "generationConfig": { ... }, "systemInstruction": { ... } } }
//! { "realtimeInput": { "mediaChunks": [ { "mimeType": "audio/pcm;rate=16000", "data": "<base64>" } ] } }
//! ```
//!
//! ## Inbound (server -> client):
//! ```json
//! { "setupComplete": {} }
//! { "serverContent": { "modelTurn": { "parts": [ { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "<base64>" } } ] } } }
//! { "serverContent": { "interrupted": true } }
//! { "goAway": { "timeLeft": "10s" } }
//! ```
//!
//! Everything the session controller consumes is flattened into
//! [`InboundMessage`], so the controller never sees the wire envelope.

use crate::audio::codec;
use crate::config::LiveConfig;
use crate::error::LiveError;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Sample rate assumed for inbound audio whose mime type has no `rate=`.
pub const DEFAULT_INBOUND_RATE: u32 = 24_000;

/// A base64 payload with its mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

/// One captured frame on its way to the backend: `{ media: { data, mimeType } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub media: MediaBlob,
}

impl OutboundMessage {
    /// Wrap base64 PCM captured at `sample_rate`.
    pub fn audio(data: String, sample_rate: u32) -> Self {
        Self {
            media: MediaBlob {
                data,
                mime_type: codec::pcm_mime_type(sample_rate),
            },
        }
    }

    /// The JSON actually written to the socket.
    pub fn to_wire(&self) -> serde_json::Value {
        json!({
            "realtimeInput": {
                "mediaChunks": [self.media]
            }
        })
    }
}

/// One inbound event as the session controller sees it.
///
/// When `interrupted` is set the controller interrupts playback before it
/// schedules any `audio_data` carried by the same message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub audio_data: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channel_count")]
    pub channel_count: u16,
    #[serde(default)]
    pub interrupted: bool,
}

fn default_sample_rate() -> u32 {
    DEFAULT_INBOUND_RATE
}

fn default_channel_count() -> u16 {
    1
}

impl InboundMessage {
    pub fn audio(data: impl Into<String>, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            audio_data: Some(data.into()),
            sample_rate,
            channel_count,
            interrupted: false,
        }
    }

    /// A barge-in notice with no audio.
    pub fn interruption() -> Self {
        Self {
            audio_data: None,
            sample_rate: DEFAULT_INBOUND_RATE,
            channel_count: 1,
            interrupted: true,
        }
    }

    pub fn with_interrupted(mut self, interrupted: bool) -> Self {
        self.interrupted = interrupted;
        self
    }
}

/// Session parameters sent once, right after the socket opens.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

impl LiveSetup {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice_name: config.voice_name.clone(),
            system_instruction: config.system_instruction.clone(),
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        json!({
            "setup": {
                "model": self.model,
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": { "voiceName": self.voice_name }
                        }
                    }
                },
                "systemInstruction": {
                    "parts": [ { "text": self.system_instruction } ]
                }
            }
        })
    }
}

/// A parsed server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// The backend accepted the setup; the session is open.
    SetupComplete,
    /// Model output, one message per audio part (or a lone interruption).
    Content(Vec<InboundMessage>),
    /// The backend will close the connection soon.
    GoAway(Option<String>),
    /// Anything this client does not act on (transcripts, tool calls, usage).
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEnvelope {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<MediaBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

fn is_pcm(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|base| base.trim().eq_ignore_ascii_case("audio/pcm"))
        .unwrap_or(false)
}

/// Parse one text or binary frame from the backend.
///
/// Malformed JSON is a `Decode` error. Non-audio parts are ignored.
pub fn parse_server_frame(payload: &[u8]) -> Result<ServerFrame, LiveError> {
    let envelope: ServerEnvelope = serde_json::from_slice(payload)
        .map_err(|e| LiveError::Decode(format!("invalid server message: {}", e)))?;

    if envelope.setup_complete.is_some() {
        return Ok(ServerFrame::SetupComplete);
    }

    if let Some(content) = envelope.server_content {
        let mut messages: Vec<InboundMessage> = content
            .model_turn
            .map(|turn| turn.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| part.inline_data)
            .filter(|blob| is_pcm(&blob.mime_type))
            .map(|blob| {
                let rate = codec::parse_pcm_rate(&blob.mime_type).unwrap_or(DEFAULT_INBOUND_RATE);
                InboundMessage::audio(blob.data, rate, 1)
            })
            .collect();

        if content.interrupted {
            match messages.first_mut() {
                Some(first) => first.interrupted = true,
                None => messages.push(InboundMessage::interruption()),
            }
        }

        return Ok(if messages.is_empty() {
            ServerFrame::Other
        } else {
            ServerFrame::Content(messages)
        });
    }

    if let Some(go_away) = envelope.go_away {
        return Ok(ServerFrame::GoAway(go_away.time_left));
    }

    Ok(ServerFrame::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_wire_shape() {
        let message = OutboundMessage::audio("AAAA".to_string(), 16000);
        let wire = message.to_wire();
        assert_eq!(wire["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(wire["realtimeInput"]["mediaChunks"][0]["data"], "AAAA");

        let flat = serde_json::to_value(&message).unwrap();
        assert_eq!(flat["media"]["mimeType"], "audio/pcm;rate=16000");
    }

    #[test]
    fn test_setup_wire_shape() {
        let setup = LiveSetup::from_config(&LiveConfig::default());
        let wire = setup.to_wire();
        assert_eq!(wire["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            wire["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Zephyr"
        );
        assert!(wire["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("technical advisor"));
    }

    #[test]
    fn test_parse_setup_complete() {
        assert_eq!(parse_server_frame(br#"{"setupComplete":{}}"#).unwrap(), ServerFrame::SetupComplete);
    }

    #[test]
    fn test_parse_audio_parts() {
        let frame = br#"{"serverContent":{"modelTurn":{"parts":[
            {"text":"hello"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
            {"inlineData":{"mimeType":"audio/pcm","data":"BBB="}}
        ]}}}"#;

        match parse_server_frame(frame).unwrap() {
            ServerFrame::Content(messages) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].audio_data.as_deref(), Some("AAA="));
                assert_eq!(messages[0].sample_rate, 24000);
                assert_eq!(messages[1].sample_rate, DEFAULT_INBOUND_RATE);
                assert!(messages.iter().all(|m| !m.interrupted && m.channel_count == 1));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_interruption() {
        let frame = br#"{"serverContent":{"interrupted":true}}"#;
        assert_eq!(
            parse_server_frame(frame).unwrap(),
            ServerFrame::Content(vec![InboundMessage::interruption()])
        );

        let frame = br#"{"serverContent":{"interrupted":true,"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]}}}"#;
        match parse_server_frame(frame).unwrap() {
            ServerFrame::Content(messages) => {
                assert_eq!(messages.len(), 1);
                assert!(messages[0].interrupted);
                assert!(messages[0].audio_data.is_some());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_go_away_and_unknown() {
        assert_eq!(
            parse_server_frame(br#"{"goAway":{"timeLeft":"5s"}}"#).unwrap(),
            ServerFrame::GoAway(Some("5s".to_string()))
        );
        assert_eq!(parse_server_frame(br#"{"usageMetadata":{}}"#).unwrap(), ServerFrame::Other);
        assert_eq!(
            parse_server_frame(br#"{"serverContent":{"turnComplete":true}}"#).unwrap(),
            ServerFrame::Other
        );
    }

    #[test]
    fn test_malformed_frame_is_decode_error() {
        assert!(matches!(parse_server_frame(b"not json"), Err(LiveError::Decode(_))));
    }

    #[test]
    fn test_inbound_message_defaults() {
        let message: InboundMessage = serde_json::from_str(r#"{"audioData":"AAA="}"#).unwrap();
        assert_eq!(message.sample_rate, 24000);
        assert_eq!(message.channel_count, 1);
        assert!(!message.interrupted);
    }
}
