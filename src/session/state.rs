use crate::types::{InteractionMode, TranscriptSource};
use crate::visualizer::ActivityState;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum LifecycleState {
    #[default]
    Inactive,
    Starting,
    Active,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub source: TranscriptSource,
    pub text: String,
}

/// Snapshot published to observers after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub lifecycle: LifecycleState,
    /// None while no session is running
    pub connection: Option<ConnectionState>,
    pub activity: ActivityState,
    pub muted: bool,
    pub mode: Option<InteractionMode>,
    /// Short user-facing reason when `lifecycle` is `Error`
    pub message: Option<String>,
    pub transcript: Option<TranscriptLine>,
    pub input_level: f32,
    pub output_level: f32,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        self.lifecycle == LifecycleState::Active
    }

    /// One-line summary for terminals and logs
    pub fn headline(&self) -> String {
        let mut line = match self.lifecycle {
            LifecycleState::Active => match self.connection {
                Some(ConnectionState::Connected) => format!("{}", self.activity),
                Some(state) => format!("{}", state),
                None => "Active".to_string(),
            },
            LifecycleState::Error => format!(
                "Error: {}",
                self.message.as_deref().unwrap_or("unknown failure")
            ),
            other => other.to_string(),
        };
        if self.muted {
            line.push_str(" [muted]");
        }
        line
    }
}
