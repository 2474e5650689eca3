//! stt-hotkey - hotkey-driven speech-to-text daemon
//!
//! A global hotkey toggles microphone capture; finished recordings go to a
//! locally hosted transcription/translation service and the resulting text is
//! delivered to the active application.

/// Audio capture and buffering
pub mod audio;
/// Configuration management
pub mod config;
/// Result delivery sinks (clipboard, synthesized keystrokes)
pub mod delivery;
/// Input handling (global hotkey)
pub mod input;
/// Fixed-duration invocation path
pub mod oneshot;
/// Backing transcription service lifecycle
pub mod service;
/// Session state machine
pub mod session;
/// Logging setup
pub mod telemetry;
/// Transcription service client
pub mod transcription;
