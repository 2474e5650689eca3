use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;

/// Sink that places transcribed text where the user can use it
///
/// Sinks are best-effort: the session pipeline logs a failure and returns to
/// idle either way, and nothing verifies the text actually landed.
#[cfg_attr(test, mockall::automock)]
pub trait ResultDelivery: Send + Sync {
    /// Deliver one transcription
    ///
    /// # Errors
    /// Returns error if the sink could not accept the text
    fn deliver(&self, text: &str) -> Result<()>;
}

/// Copies the transcription to the system clipboard
pub struct ClipboardDelivery;

impl ResultDelivery for ClipboardDelivery {
    fn deliver(&self, text: &str) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
        clipboard
            .set_text(text)
            .context("failed to copy text to clipboard")?;
        debug!(chars = text.len(), "text copied to clipboard");
        Ok(())
    }
}

/// Types the transcription into the currently focused window
pub struct TypingDelivery {
    start_delay: Duration,
}

impl TypingDelivery {
    #[must_use]
    pub const fn new(start_delay: Duration) -> Self {
        Self { start_delay }
    }
}

impl ResultDelivery for TypingDelivery {
    fn deliver(&self, text: &str) -> Result<()> {
        // Give focus a moment to settle on the window the user was dictating into
        std::thread::sleep(self.start_delay);

        let mut enigo = enigo::Enigo::new(&enigo::Settings::default())
            .map_err(|e| anyhow!("failed to initialize keystroke synthesis: {e}"))?;
        enigo::Keyboard::text(&mut enigo, text)
            .map_err(|e| anyhow!("failed to type text: {e}"))?;

        debug!(chars = text.len(), "text typed into focused window");
        Ok(())
    }
}

/// Fans a transcription out to every configured sink
pub struct CompositeDelivery {
    sinks: Vec<Box<dyn ResultDelivery>>,
}

impl CompositeDelivery {
    #[must_use]
    pub fn new(sinks: Vec<Box<dyn ResultDelivery>>) -> Self {
        Self { sinks }
    }

    /// Build the sinks enabled in config: clipboard first, then auto-type
    #[must_use]
    pub fn from_config(config: &DeliveryConfig) -> Self {
        let mut sinks: Vec<Box<dyn ResultDelivery>> = Vec::new();
        if config.clipboard {
            sinks.push(Box::new(ClipboardDelivery));
        }
        if config.auto_type {
            sinks.push(Box::new(TypingDelivery::new(Duration::from_millis(
                config.type_start_delay_ms,
            ))));
        }
        Self::new(sinks)
    }
}

impl ResultDelivery for CompositeDelivery {
    fn deliver(&self, text: &str) -> Result<()> {
        if self.sinks.is_empty() {
            return Ok(());
        }

        let mut delivered = 0_usize;
        for sink in &self.sinks {
            match sink.deliver(text) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("delivery sink failed: {:#}", e),
            }
        }

        if delivered == 0 {
            return Err(anyhow!("all delivery sinks failed"));
        }
        Ok(())
    }
}

/// Fire-and-forget desktop notification for session failures
///
/// Missing `notify-send` is not an error; the log line already carries the
/// failure.
pub fn notify_failure(summary: &str, body: &str) {
    let spawned = std::process::Command::new("notify-send")
        .args(["-u", "critical", "-t", "2000", "-a", "STT", summary, body])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    if let Err(e) = spawned {
        debug!("notify-send unavailable: {}", e);
    }
}
