use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use super::{Language, TranscriptionResult};
use crate::audio::AudioBuffer;
use crate::config::TranscriptionConfig;
use crate::service::ServiceHandle;

/// Errors from a single transcription request
///
/// The client never retries; the retry policy lives with the session
/// controller.
#[derive(Debug, Error)]
pub enum TranscribeError {
    /// The bounded request timeout elapsed
    #[error("transcription request timed out")]
    Timeout,

    /// Transport-level failure; the service may be gone
    #[error("transcription request failed: {source}")]
    RequestFailed {
        /// Underlying transport error
        source: anyhow::Error,
    },

    /// The service answered with a non-success status
    #[error("transcription service error ({status}): {detail}")]
    ServiceError {
        /// HTTP status code
        status: u16,
        /// Response body, for the log line
        detail: String,
    },
}

/// Wire format of the service's chunk endpoint
#[derive(Debug, Deserialize)]
struct ChunkResponse {
    raw_text: String,
    translation: String,
    detected_language: String,
    #[serde(default)]
    processing_time_s: f64,
}

impl ChunkResponse {
    fn into_result(self) -> TranscriptionResult {
        TranscriptionResult {
            source_text: self.raw_text.trim().to_owned(),
            translated_text: self.translation.trim().to_owned(),
            detected_language: self.detected_language,
        }
    }
}

/// Dispatching a finished recording to the transcription service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    /// Send the buffer and return both the source text and its translation
    ///
    /// # Errors
    /// `Timeout` when the request timeout elapses, `RequestFailed` on
    /// transport errors, `ServiceError` on non-success responses
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        target: Language,
        source: Option<Language>,
        handle: &ServiceHandle,
    ) -> Result<TranscriptionResult, TranscribeError>;
}

/// HTTP client for the service's multipart chunk endpoint
pub struct TranscriptionClient {
    http: reqwest::Client,
    session_id: String,
    chunk_counter: AtomicU64,
}

impl TranscriptionClient {
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build transcription client")?;

        Ok(Self {
            http,
            session_id: Uuid::new_v4().to_string(),
            chunk_counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl SpeechTranscriber for TranscriptionClient {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        target: Language,
        source: Option<Language>,
        handle: &ServiceHandle,
    ) -> Result<TranscriptionResult, TranscribeError> {
        let span = tracing::debug_span!("transcribe", samples = audio.samples().len());
        async move {
        let wav = audio
            .to_wav_bytes()
            .map_err(|e| TranscribeError::RequestFailed {
                source: anyhow!(e).context("failed to encode WAV payload"),
            })?;

        let chunk_id = self.chunk_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscribeError::RequestFailed {
                source: anyhow!(e),
            })?;

        let mut form = reqwest::multipart::Form::new()
            .text("session_id", self.session_id.clone())
            .text("chunk_id", chunk_id.to_string())
            .text("target_language", target.code())
            .part("file", part);
        if let Some(lang) = source {
            form = form.text("language", lang.code());
        }

        debug!(chunk_id, target = %target, "sending transcription request");

        let response = self
            .http
            .post(format!("{}/chunk/", handle.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranscribeError::Timeout
                } else {
                    TranscribeError::RequestFailed { source: anyhow!(e) }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_owned());
            return Err(TranscribeError::ServiceError {
                status: status.as_u16(),
                detail,
            });
        }

        let body: ChunkResponse =
            response
                .json()
                .await
                .map_err(|e| TranscribeError::RequestFailed {
                    source: anyhow!(e).context("failed to parse service response"),
                })?;

        info!(
            detected = %body.detected_language,
            processing_s = body.processing_time_s,
            "transcription completed"
        );

        Ok(body.into_result())
        }
        .instrument(span)
        .await
    }
}
