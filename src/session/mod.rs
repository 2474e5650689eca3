/// Session state machine and transcription pipeline
pub mod controller;

pub use controller::{SessionController, SessionPolicy};

use std::time::Instant;

use crate::transcription::Language;

/// Daemon-visible session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a hotkey press
    Idle,
    /// Hotkey held, microphone capturing
    Recording,
    /// Request in flight to the transcription service
    Transcribing,
    /// Handing the text to the delivery sinks
    Delivering,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Transcribing => "transcribing",
            Self::Delivering => "delivering",
        };
        f.write_str(name)
    }
}

/// One recording-to-delivery cycle; at most one exists at a time
#[derive(Debug, Clone)]
pub struct Session {
    /// When the hotkey press was accepted
    pub started_at: Instant,
    /// Language the service will translate into
    pub target_language: Language,
}

/// Edge of a hotkey event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEventKind {
    /// Hotkey went down
    Press,
    /// Hotkey came back up
    Release,
}

/// Transient hotkey edge event; consumed by the controller and discarded
#[derive(Debug, Clone, Copy)]
pub struct HotkeyEvent {
    /// Press or release
    pub kind: HotkeyEventKind,
    /// When the edge was observed by the listener
    pub timestamp: Instant,
}

impl HotkeyEvent {
    #[must_use]
    pub fn press() -> Self {
        Self {
            kind: HotkeyEventKind::Press,
            timestamp: Instant::now(),
        }
    }

    #[must_use]
    pub fn release() -> Self {
        Self {
            kind: HotkeyEventKind::Release,
            timestamp: Instant::now(),
        }
    }
}
