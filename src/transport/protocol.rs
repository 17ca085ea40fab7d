//! JSON messages of the Live `BidiGenerateContent` stream.

use super::{EncodedChunk, ServerEvent, SessionSetup};
use crate::error::VoiceError;
use crate::pcm;
use crate::types::TranscriptSource;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Message has no recognised fields")]
    Unrecognised,
}

impl From<ProtocolError> for VoiceError {
    fn from(err: ProtocolError) -> Self {
        VoiceError::MalformedPayload(err.to_string())
    }
}

// Outbound

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupEnvelope<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Empty>,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeEnvelope {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
struct RealtimeInput {
    audio: Blob,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    data: String,
    mime_type: String,
}

pub fn setup_message(setup: &SessionSetup) -> Result<String, ProtocolError> {
    let envelope = SetupEnvelope {
        setup: Setup {
            model: &setup.model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &setup.voice,
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: [TextPart {
                    text: &setup.system_instruction,
                }],
            },
            input_audio_transcription: setup.transcribe_input.then_some(Empty {}),
            output_audio_transcription: setup.transcribe_output.then_some(Empty {}),
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn realtime_audio_message(chunk: &EncodedChunk) -> Result<String, ProtocolError> {
    let envelope = RealtimeEnvelope {
        realtime_input: RealtimeInput {
            audio: Blob {
                data: pcm::to_transport_text(&chunk.data),
                mime_type: chunk.mime_type.clone(),
            },
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

// Inbound

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Parse one inbound frame into zero or more events.
///
/// Audio parts whose base64 does not decode are logged and skipped; the rest
/// of the message still yields its events.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>, ProtocolError> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ServerEvent::Opened);
    }

    if let Some(go_away) = &message.go_away {
        log::warn!(
            "Transport: Server is going away (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }

    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }

        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ServerEvent::TranscriptDelta {
                    source: TranscriptSource::User,
                    text,
                });
            }
        }

        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else {
                continue;
            };
            if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
                log::debug!("Transport: Ignoring inline {} part", inline.mime_type);
                continue;
            }
            match pcm::from_transport_text(&inline.data) {
                Ok(payload) => events.push(ServerEvent::AudioChunk { payload }),
                Err(e) => log::warn!("Transport: Skipping undecodable audio part: {}", e),
            }
        }

        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ServerEvent::TranscriptDelta {
                    source: TranscriptSource::Model,
                    text,
                });
            }
        }

        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    } else if events.is_empty() && message.go_away.is_none() {
        return Err(ProtocolError::Unrecognised);
    }

    Ok(events)
}

/// Binary frames carry the same JSON as text frames.
pub fn parse_server_bytes(bytes: &[u8]) -> Result<Vec<ServerEvent>, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
    parse_server_message(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceConfig as SessionConfig;
    use crate::types::InteractionMode;
    use serde_json::{json, Value};

    #[test]
    fn test_setup_message_shape() {
        let setup = SessionSetup::new(&SessionConfig::default(), InteractionMode::Hierarchical);
        let value: Value = serde_json::from_str(&setup_message(&setup).unwrap()).unwrap();
        let setup_json = &value["setup"];

        assert_eq!(setup_json["model"], json!(setup.model));
        assert_eq!(
            setup_json["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            setup_json["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            json!("Zephyr")
        );
        let instruction = setup_json["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(instruction.contains("Hierarchical"));
        assert_eq!(setup_json["inputAudioTranscription"], json!({}));
        assert_eq!(setup_json["outputAudioTranscription"], json!({}));
    }

    #[test]
    fn test_transcription_fields_omitted_when_disabled() {
        let mut setup = SessionSetup::new(&SessionConfig::default(), InteractionMode::default());
        setup.transcribe_input = false;
        setup.transcribe_output = false;
        let value: Value = serde_json::from_str(&setup_message(&setup).unwrap()).unwrap();
        assert!(value["setup"].get("inputAudioTranscription").is_none());
        assert!(value["setup"].get("outputAudioTranscription").is_none());
    }

    #[test]
    fn test_realtime_audio_message() {
        let chunk = EncodedChunk {
            data: vec![0x01, 0x00, 0xff, 0x7f],
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        let value: Value = serde_json::from_str(&realtime_audio_message(&chunk).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"audio": {
                "data": "AQD/fw==",
                "mimeType": "audio/pcm;rate=16000"
            }}})
        );
    }

    #[test]
    fn test_setup_complete_opens() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            vec![ServerEvent::Opened]
        );
    }

    #[test]
    fn test_model_turn_with_audio_and_transcripts() {
        let message = json!({
            "serverContent": {
                "inputTranscription": {"text": "hello"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQI="}},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AwQ="}}
                ]},
                "outputTranscription": {"text": "Hi"},
                "turnComplete": true
            }
        });
        let events = parse_server_message(&message.to_string()).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::TranscriptDelta {
                    source: TranscriptSource::User,
                    text: "hello".to_string()
                },
                ServerEvent::AudioChunk {
                    payload: vec![1, 2]
                },
                ServerEvent::AudioChunk {
                    payload: vec![3, 4]
                },
                ServerEvent::TranscriptDelta {
                    source: TranscriptSource::Model,
                    text: "Hi".to_string()
                },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_bad_audio_part_is_skipped() {
        let message = json!({
            "serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm", "data": "!!not base64!!"}},
                {"inlineData": {"mimeType": "audio/pcm", "data": "AAA="}},
                {"text": "thinking"}
            ]}}
        });
        let events = parse_server_message(&message.to_string()).unwrap();
        assert_eq!(events, vec![ServerEvent::AudioChunk { payload: vec![0, 0] }]);
    }

    #[test]
    fn test_interrupted() {
        let events = parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::Interrupted]);
    }

    #[test]
    fn test_malformed_and_unknown_messages() {
        assert!(matches!(
            parse_server_message("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            parse_server_message(r#"{"somethingElse":1}"#),
            Err(ProtocolError::Unrecognised)
        ));
        assert!(matches!(
            parse_server_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
        assert!(parse_server_message(r#"{"goAway":{"timeLeft":"10s"}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_binary_frames_parse_like_text() {
        let events = parse_server_bytes(br#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::Opened]);
    }
}
