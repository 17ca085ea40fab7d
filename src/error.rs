use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Generation request failed: {0}")]
    Generation(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Short, non-technical status line for the user-facing session indicator.
    pub fn status_message(&self) -> &'static str {
        match self {
            VoiceError::PermissionDenied(_) => "Microphone access was denied",
            VoiceError::DeviceUnavailable(_) => "No audio device available",
            VoiceError::Transport(_) | VoiceError::MalformedPayload(_) => {
                "Connection to the voice service was lost"
            }
            VoiceError::Decode(_) => "Some audio could not be played",
            VoiceError::Storage(_) => "History could not be saved",
            VoiceError::Config(_) => "Voice session is not configured",
            VoiceError::Generation(_) => "Something went wrong, please try again",
            VoiceError::Cancelled => "Session ended",
            VoiceError::Io(_) => "Unexpected I/O failure",
        }
    }

    /// Fatal errors move the session to the error state; the rest are logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_)
                | VoiceError::DeviceUnavailable(_)
                | VoiceError::Transport(_)
                | VoiceError::Config(_)
        )
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::MalformedPayload(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for VoiceError {
    fn from(err: url::ParseError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for VoiceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("device is no longer available".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                VoiceError::PermissionDenied(err.description)
            }
            other => VoiceError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("device is no longer available".to_string())
            }
            cpal::PlayStreamError::BackendSpecific { err } => {
                VoiceError::PermissionDenied(err.description)
            }
        }
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Generation(err.to_string())
    }
}
