use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transcription::Language;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub hotkey: HotkeyConfig,
    pub audio: AudioConfig,
    pub service: ServiceConfig,
    pub transcription: TranscriptionConfig,
    pub delivery: DeliveryConfig,
    pub session: SessionConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HotkeyConfig {
    pub modifiers: Vec<String>,
    pub key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    /// Target sample rate for the transcription payload
    pub sample_rate: u32,
    /// Ring buffer sizing, in seconds of audio at the device rate
    pub ring_buffer_secs: usize,
    /// Safety cutoff for a single recording; 0 disables it
    pub max_duration_secs: u64,
    /// Captures shorter than this are rejected as empty
    pub min_duration_ms: u64,
}

impl AudioConfig {
    /// Cutoff as a duration, `None` when disabled
    #[must_use]
    pub const fn max_duration(&self) -> Option<Duration> {
        if self.max_duration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_duration_secs))
        }
    }

    #[must_use]
    pub const fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_duration_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Host port the container publishes the API on
    pub host_port: u16,
    /// Container image for the backing service
    pub image: String,
    /// Name given to the managed container
    pub container_name: String,
    /// Pass `--gpus all` when starting the container
    pub gpu: bool,
    /// Total budget for the service to become ready after a start
    pub readiness_timeout_secs: u64,
    /// Interval between readiness probes
    pub poll_interval_ms: u64,
}

impl ServiceConfig {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.host_port)
    }

    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptionConfig {
    /// Bound on a single transcription request, distinct from the readiness budget
    pub request_timeout_secs: u64,
    /// Language the service translates into
    pub target_language: Language,
    /// Source language override; omit for auto-detection
    pub source_language: Option<Language>,
}

impl TranscriptionConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Copy the transcription to the system clipboard
    pub clipboard: bool,
    /// Type the transcription into the focused window
    pub auto_type: bool,
    /// Delay before typing so focus can settle after the hotkey release
    pub type_start_delay_ms: u64,
    /// Surface session failures via desktop notifications
    pub notify: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Grace period for cancelling in-flight work on shutdown
    pub shutdown_grace_ms: u64,
    /// Depth of the bounded hotkey event queue
    pub queue_depth: usize,
}

impl SessionConfig {
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub file_logging: bool,
    pub log_path: String,
}

impl Config {
    /// Load config from ~/.stt-hotkey.toml, creating a default file on first run,
    /// then apply `STT_HOST_PORT` / `STT_IMAGE` / `STT_LANGUAGE` overrides
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or created
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        let contents = fs::read_to_string(&config_path).context("failed to read config file")?;

        let mut config: Self = toml::from_str(&contents).context("failed to parse config TOML")?;
        config.apply_env_overrides()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("STT_HOST_PORT") {
            self.service.host_port = port
                .parse()
                .with_context(|| format!("invalid STT_HOST_PORT value: {port}"))?;
        }
        if let Ok(image) = std::env::var("STT_IMAGE") {
            self.service.image = image;
        }
        if let Ok(lang) = std::env::var("STT_LANGUAGE") {
            self.transcription.target_language = Language::from_code(&lang)
                .with_context(|| format!("invalid STT_LANGUAGE value: {lang}"))?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".stt-hotkey.toml"))
    }

    fn create_default(path: &Path) -> Result<()> {
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = r#"[hotkey]
modifiers = ["Control", "Shift"]
key = "Space"

[audio]
sample_rate = 16000
ring_buffer_secs = 30
max_duration_secs = 0
min_duration_ms = 500

[service]
host_port = 8001
image = "stt-service:latest"
container_name = "stt-whisper"
gpu = true
readiness_timeout_secs = 90
poll_interval_ms = 1000

[transcription]
request_timeout_secs = 120
target_language = "en"

[delivery]
clipboard = true
auto_type = true
type_start_delay_ms = 200
notify = true

[session]
shutdown_grace_ms = 2000
queue_depth = 32

[telemetry]
file_logging = false
log_path = "~/.stt-hotkey/daemon.log"
"#;
