use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

impl From<ConfigError> for crate::error::VoiceError {
    fn from(err: ConfigError) -> Self {
        crate::error::VoiceError::Config(err.to_string())
    }
}

pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Bidirectional streaming endpoint of the Live API
pub const LIVE_ENDPOINT: &str = concat!(
    "wss://generativelanguage.googleapis.com/ws/",
    "google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
);

/// Configuration for the hosted model API
#[derive(Debug)]
pub struct ApiConfig {
    pub api_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let api_key = Self::load_api_key(API_KEY_VAR, "Gemini")?;
        Ok(Self { api_key })
    }

    pub fn from_key(key: &str) -> Result<Self, ConfigError> {
        Self::validate_key_format(key, "Gemini")?;
        Ok(Self {
            api_key: SecretBox::new(Box::new(key.to_string())),
        })
    }

    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;
        Self::validate_key_format(&key, service_name)?;
        Ok(SecretBox::new(Box::new(key)))
    }

    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }
        if key.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "API key must not contain whitespace".to_string(),
            });
        }
        Ok(())
    }

    /// Get the API key (use only when making API calls)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Tunables for a realtime voice session.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Rate the microphone path is resampled to and streamed at
    pub capture_sample_rate: u32,
    /// Rate of the synthesized audio the service streams back
    pub playback_sample_rate: u32,
    /// Samples per capture frame (4096 @ 16kHz = 256ms)
    pub frame_size: usize,
    /// Capacity of the callback → driver frame queue
    pub frame_queue: usize,
    /// Redraw cadence of the visualizer
    pub tick_interval: Duration,
    /// Inactivity after which the live transcript is cleared
    pub transcript_timeout: Duration,
    pub model: String,
    pub voice: String,
    pub live_endpoint: String,
    /// Capture device name, None = system default
    pub input_device: Option<String>,
    /// Playback device name, None = system default
    pub output_device: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            frame_size: 4096,
            frame_queue: 64,
            tick_interval: Duration::from_millis(16),
            transcript_timeout: Duration::from_secs(3),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Zephyr".to_string(),
            live_endpoint: LIVE_ENDPOINT.to_string(),
            input_device: None,
            output_device: None,
        }
    }
}

impl VoiceConfig {
    /// MIME descriptor for outbound PCM frames
    pub fn capture_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.capture_sample_rate)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.capture_sample_rate as f64)
    }
}

/// Settings for the structured (non-streaming) generation endpoint.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(ApiConfig::validate_key_format("AIzaSyTest123", "Gemini").is_ok());
        assert!(ApiConfig::validate_key_format("", "Gemini").is_err());
        assert!(ApiConfig::validate_key_format("   ", "Gemini").is_err());
        assert!(ApiConfig::validate_key_format("abc def", "Gemini").is_err());
    }

    #[test]
    fn test_from_key_exposes_secret() {
        let config = ApiConfig::from_key("AIzaSyTest123").unwrap();
        assert_eq!(config.api_key(), "AIzaSyTest123");
    }

    #[test]
    fn test_voice_defaults() {
        let config = VoiceConfig::default();
        assert_eq!(config.capture_sample_rate, 16_000);
        assert_eq!(config.playback_sample_rate, 24_000);
        assert_eq!(config.frame_size, 4096);
        assert_eq!(config.capture_mime_type(), "audio/pcm;rate=16000");
        assert_eq!(config.frame_duration(), Duration::from_millis(256));
    }
}
