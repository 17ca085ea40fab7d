//! Bidirectional streaming session with the hosted voice model.

pub mod protocol;
pub mod websocket;

use crate::audio_capture::AudioFrame;
use crate::config::VoiceConfig;
use crate::error::Result;
use crate::pcm;
use crate::types::{system_instruction, InteractionMode, TranscriptSource};
use tokio::sync::mpsc;

pub use protocol::ProtocolError;
pub use websocket::LiveConnector;

/// Everything the session can hear from the server, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server acknowledged the setup message
    Opened,
    /// 16-bit little-endian PCM at the playback rate
    AudioChunk { payload: Vec<u8> },
    TranscriptDelta {
        source: TranscriptSource,
        text: String,
    },
    /// The user barged in; queued playback is stale
    Interrupted,
    TurnComplete,
    Closed,
    Error { detail: String },
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// One outbound audio frame, already PCM encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl EncodedChunk {
    pub fn from_frame(frame: &AudioFrame, mime_type: &str) -> Self {
        Self {
            data: pcm::encode(&frame.samples),
            mime_type: mime_type.to_string(),
        }
    }
}

/// Parameters sent once when a session opens
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub mode: InteractionMode,
    pub system_instruction: String,
    pub transcribe_input: bool,
    pub transcribe_output: bool,
}

impl SessionSetup {
    pub fn new(config: &VoiceConfig, mode: InteractionMode) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            mode,
            system_instruction: system_instruction(mode),
            transcribe_input: true,
            transcribe_output: true,
        }
    }
}

/// Opens transport sessions. Every server event of the new session is
/// delivered on `events`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        setup: &SessionSetup,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>>;
}

pub trait TransportSession: Send {
    /// Queue a chunk for sending. Never blocks and never fails; a lost
    /// connection is reported as [`ServerEvent::Error`].
    fn send(&self, chunk: EncodedChunk);

    /// Close the connection. Idempotent; no events follow.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
