pub mod analyser;
pub mod audio_capture;
pub mod audio_sink;
pub mod config;
pub mod error;
pub mod generation;
pub mod history;
pub mod pcm;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod transport;
pub mod types;
pub mod visualizer;

pub use error::{Result, VoiceError};
pub use session::{SessionController, SessionStatus};
pub use types::InteractionMode;
