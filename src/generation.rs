//! Structured (non-streaming) council responses from the `generateContent`
//! endpoint.

use crate::config::{ApiConfig, GenerationConfig};
use crate::error::VoiceError;
use crate::pcm;
use crate::types::{system_instruction, Agent, InteractionMode};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use thiserror::Error;

/// Shown to the user whenever a request fails, whatever the cause
pub const RETRY_MESSAGE: &str = "The council could not be reached. Please try again.";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Response had no content")]
    EmptyResponse,
    #[error("Response did not match the schema: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("Could not read attachment: {0}")]
    Attachment(#[from] std::io::Error),
}

impl GenerationError {
    pub fn user_message(&self) -> &'static str {
        RETRY_MESSAGE
    }
}

impl From<GenerationError> for VoiceError {
    fn from(err: GenerationError) -> Self {
        VoiceError::Generation(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub agent: Agent,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub concept: String,
    pub definition: String,
    /// 0..=1
    pub connection_strength: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicMemory {
    pub event_summary: String,
    pub timestamp_context: String,
    pub emotional_residue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilResponse {
    pub context_description: String,
    pub dialogue: Vec<DialogueTurn>,
    #[serde(default)]
    pub semantic_memory: Vec<SemanticMemory>,
    pub episodic_memory: EpisodicMemory,
    /// Ordered reasoning steps, one sentence each
    #[serde(default)]
    pub structured_sense_making: Vec<String>,
}

impl CouncilResponse {
    /// Memory fields only, fed back as context on the next request
    pub fn memory_json(&self) -> Value {
        json!({
            "semantic_memory": self.semantic_memory,
            "episodic_memory": self.episodic_memory,
        })
    }
}

/// Image, audio or video sent inline with the prompt
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl MediaAttachment {
    pub fn from_path(path: &Path) -> Result<Self, GenerationError> {
        let data = std::fs::read(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Ok(Self {
            mime_type: mime_for_extension(&extension).to_string(),
            data,
        })
    }
}

fn mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Default)]
pub struct CouncilRequest {
    pub text: String,
    pub mode: InteractionMode,
    pub media: Option<MediaAttachment>,
    /// Memory from an earlier response, see [`CouncilResponse::memory_json`]
    pub prior_memory: Option<Value>,
}

fn response_schema() -> Value {
    let string = json!({"type": "STRING"});
    json!({
        "type": "OBJECT",
        "properties": {
            "context_description": string,
            "dialogue": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "agent": {
                            "type": "STRING",
                            "enum": ["Linguist", "Spark", "Mystic", "Synthesizer", "User"]
                        },
                        "content": string,
                        "emotion": string
                    },
                    "required": ["agent", "content"]
                }
            },
            "semantic_memory": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "concept": string,
                        "definition": string,
                        "connection_strength": {"type": "NUMBER"}
                    },
                    "required": ["concept", "definition", "connection_strength"]
                }
            },
            "episodic_memory": {
                "type": "OBJECT",
                "properties": {
                    "event_summary": string,
                    "timestamp_context": string,
                    "emotional_residue": string
                },
                "required": ["event_summary", "timestamp_context", "emotional_residue"]
            },
            "structured_sense_making": {"type": "ARRAY", "items": string}
        },
        "required": [
            "context_description",
            "dialogue",
            "semantic_memory",
            "episodic_memory",
            "structured_sense_making"
        ]
    })
}

pub fn build_request_body(request: &CouncilRequest) -> Value {
    let mut text = request.text.clone();
    if let Some(memory) = &request.prior_memory {
        text.push_str("\n\nPrior memory:\n");
        text.push_str(&memory.to_string());
    }

    let mut parts = vec![json!({"text": text})];
    if let Some(media) = &request.media {
        parts.push(json!({
            "inlineData": {
                "mimeType": media.mime_type,
                "data": pcm::to_transport_text(&media.data),
            }
        }));
    }

    json!({
        "systemInstruction": {"parts": [{"text": system_instruction(request.mode)}]},
        "contents": [{"role": "user", "parts": parts}],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": response_schema(),
        }
    })
}

/// Pull the JSON document out of a `generateContent` response body.
pub fn parse_response(body: &Value) -> Result<CouncilResponse, GenerationError> {
    let text = body["candidates"][0]["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|part| part["text"].as_str())
        .collect::<String>();
    if text.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(serde_json::from_str(&text)?)
}

pub struct CouncilClient {
    client: Client,
    api_key: SecretString,
    config: GenerationConfig,
}

impl CouncilClient {
    pub fn new(api: &ApiConfig, config: GenerationConfig) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_key: SecretString::from(api.api_key().to_string()),
            config,
        })
    }

    pub async fn ask(&self, request: &CouncilRequest) -> Result<CouncilResponse, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        );
        log::info!(
            "Generation: Asking {} ({} mode, media: {})",
            self.config.model,
            request.mode,
            request.media.as_ref().map(|m| m.mime_type.as_str()).unwrap_or("none")
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&build_request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Generation: API error {}: {}", status, message);
            return Err(GenerationError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        let parsed = parse_response(&body)?;
        log::debug!(
            "Generation: {} dialogue turns, {} concepts",
            parsed.dialogue.len(),
            parsed.semantic_memory.len()
        );
        Ok(parsed)
    }
}
