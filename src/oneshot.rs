use anyhow::Result;
use std::time::Duration;
use tracing::info;

use crate::audio::AudioCapture;
use crate::config::Config;
use crate::service::{DockerRuntime, HttpReadinessProbe, ServiceControl, ServiceLifecycle};
use crate::session::controller::transcribe_session;
use crate::session::SessionPolicy;
use crate::transcription::{Language, TranscriptionClient, TranscriptionResult};

/// Record for a fixed duration, transcribe, and return both texts
///
/// The non-hotkey invocation path. The requested duration is clamped to the
/// configured safety cutoff, and the same readiness and retry policy applies
/// as for hotkey sessions. The caller receives the source text and the
/// translation; nothing is sent to the delivery sinks.
///
/// # Errors
/// Returns error if the service cannot be made ready, the capture fails, or
/// the transcription request fails after the retry policy is exhausted
pub async fn record_and_transcribe(
    config: &Config,
    duration: Duration,
    language: Language,
) -> Result<TranscriptionResult> {
    let lifecycle = ServiceLifecycle::new(
        DockerRuntime::new(&config.service),
        HttpReadinessProbe::new()?,
        config.service.base_url(),
        config.service.poll_interval(),
    );

    let mut policy = SessionPolicy::from_config(config);
    policy.target_language = language;

    // Bring the service up before touching the microphone so the recording
    // window is not spent waiting on a model load
    lifecycle.ensure_ready(policy.readiness_timeout).await?;

    let mut capture = AudioCapture::new(config.audio.clone());
    info!(secs = duration.as_secs_f64(), target = %language, "recording");
    let buffer = capture.record_for(duration).await?;

    let client = TranscriptionClient::new(&config.transcription)?;
    let result = transcribe_session(&lifecycle, &client, &buffer, &policy).await?;

    info!(
        detected = %result.detected_language,
        chars = result.source_text.len(),
        "one-shot transcription complete"
    );
    Ok(result)
}
