use anyhow::anyhow;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{AudioBuffer, CaptureDevice, CaptureError};
use crate::config::AudioConfig;

/// Keeps the platform input stream alive while a capture is active.
/// Dropping the guard releases the microphone.
trait StreamGuard {}

impl StreamGuard for cpal::Stream {}

struct ActiveCapture {
    /// Held for its Drop impl; dropping stops the stream and frees the device
    _stream: Box<dyn StreamGuard>,
    consumer: HeapCons<f32>,
    collecting: Arc<AtomicBool>,
    limit_hit: Arc<AtomicBool>,
    device_sample_rate: u32,
    device_channels: u16,
    started_at: Instant,
}

/// Microphone capture for one session at a time
///
/// The input stream is created on [`start`](Self::start) and torn down on every
/// exit path ([`stop`](Self::stop), [`abort`](Self::abort), drop), so the
/// device is only held while a session is recording.
pub struct AudioCapture {
    config: AudioConfig,
    active: Option<ActiveCapture>,
}

impl AudioCapture {
    #[must_use]
    pub const fn new(config: AudioConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    /// Whether a capture is currently holding the microphone
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the default input device and begin collecting samples
    ///
    /// `limit` is the optional safety cutoff: once that much audio has been
    /// collected the stream stops pushing and the eventual buffer is flagged
    /// truncated.
    ///
    /// # Errors
    /// `AlreadyRecording` if a capture is in progress, `Unavailable` if the
    /// device cannot be acquired
    pub fn start(&mut self, limit: Option<Duration>) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            CaptureError::Unavailable {
                source: anyhow!("no input device available"),
            }
        })?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_owned());

        let supported_config =
            device
                .default_input_config()
                .map_err(|e| CaptureError::Unavailable {
                    source: anyhow!(e).context("failed to get default input config"),
                })?;

        let device_sample_rate = supported_config.sample_rate();
        let device_channels = supported_config.channels();

        info!(
            device = %device_name,
            rate = device_sample_rate,
            channels = device_channels,
            "starting capture"
        );

        let capacity = (device_sample_rate as usize)
            * (device_channels as usize)
            * self.config.ring_buffer_secs.max(1);
        let (mut producer, consumer) = HeapRb::<f32>::new(capacity).split();

        // Cutoff expressed in device-rate samples across all channels
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let limit_samples = limit.map(|d| {
            (d.as_secs_f64() * f64::from(device_sample_rate)) as usize * device_channels as usize
        });

        let collecting = Arc::new(AtomicBool::new(true));
        let limit_hit = Arc::new(AtomicBool::new(false));
        let pushed = Arc::new(AtomicUsize::new(0));

        let cb_collecting = Arc::clone(&collecting);
        let cb_limit_hit = Arc::clone(&limit_hit);
        let cb_pushed = Arc::clone(&pushed);

        let stream = device
            .build_input_stream(
                &supported_config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    collect_frame(
                        &mut producer,
                        data,
                        limit_samples,
                        &cb_pushed,
                        &cb_collecting,
                        &cb_limit_hit,
                    );
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::Unavailable {
                source: anyhow!(e).context("failed to build input stream"),
            })?;

        stream.play().map_err(|e| CaptureError::Unavailable {
            source: anyhow!(e).context("failed to start input stream"),
        })?;

        self.active = Some(ActiveCapture {
            _stream: Box::new(stream),
            consumer,
            collecting,
            limit_hit,
            device_sample_rate,
            device_channels,
            started_at: Instant::now(),
        });

        Ok(())
    }

    /// Stop collecting, release the microphone, and return the captured buffer
    ///
    /// # Errors
    /// `EmptyCapture` if nothing was recorded or the capture is shorter than
    /// the configured minimum
    pub fn stop(&mut self) -> Result<AudioBuffer, CaptureError> {
        let _span = tracing::debug_span!("capture_stop").entered();

        let Some(active) = self.active.take() else {
            return Err(CaptureError::EmptyCapture);
        };

        active.collecting.store(false, Ordering::Relaxed);
        let elapsed = active.started_at.elapsed();
        let truncated = active.limit_hit.load(Ordering::Relaxed);

        let ActiveCapture {
            _stream,
            mut consumer,
            device_sample_rate,
            device_channels,
            ..
        } = active;
        // Dropping the stream here releases the device before we post-process
        drop(_stream);

        let mut raw = Vec::new();
        while let Some(sample) = consumer.try_pop() {
            raw.push(sample);
        }

        debug!(
            raw_samples = raw.len(),
            elapsed_ms = elapsed.as_millis(),
            truncated,
            "capture drained"
        );

        let samples = downmix_and_resample(
            &raw,
            device_channels,
            device_sample_rate,
            self.config.sample_rate,
        );
        let buffer = AudioBuffer::new(samples, self.config.sample_rate, truncated);

        if buffer.duration() < self.config.min_duration() {
            info!(
                duration_ms = buffer.duration().as_millis(),
                "capture below minimum, discarding"
            );
            return Err(CaptureError::EmptyCapture);
        }

        info!(
            samples = buffer.samples().len(),
            duration_ms = buffer.duration().as_millis(),
            "capture complete"
        );
        Ok(buffer)
    }

    /// Discard any in-progress capture and release the microphone
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.collecting.store(false, Ordering::Relaxed);
            info!("capture aborted, microphone released");
        }
    }

    /// Record for a fixed duration, clamped to the configured safety cutoff
    ///
    /// The buffer is flagged truncated only when the cutoff is shorter than the
    /// requested duration; a request equal to the cutoff is a full capture.
    ///
    /// # Errors
    /// Propagates [`start`](Self::start) and [`stop`](Self::stop) failures
    pub async fn record_for(&mut self, requested: Duration) -> Result<AudioBuffer, CaptureError> {
        let effective = match self.config.max_duration() {
            Some(cutoff) if cutoff < requested => cutoff,
            _ => requested,
        };

        self.start(None)?;
        tokio::time::sleep(effective).await;

        let mut buffer = self.stop()?;
        buffer.set_truncated(requested > effective);
        Ok(buffer)
    }
}

impl CaptureDevice for AudioCapture {
    fn start(&mut self, limit: Option<Duration>) -> Result<(), CaptureError> {
        Self::start(self, limit)
    }

    fn stop(&mut self) -> Result<AudioBuffer, CaptureError> {
        Self::stop(self)
    }

    fn abort(&mut self) {
        Self::abort(self);
    }

    fn is_active(&self) -> bool {
        Self::is_active(self)
    }
}

/// Ring-buffer push for one stream callback, honoring the optional cutoff
fn collect_frame(
    producer: &mut HeapProd<f32>,
    data: &[f32],
    limit_samples: Option<usize>,
    pushed: &AtomicUsize,
    collecting: &AtomicBool,
    limit_hit: &AtomicBool,
) {
    if !collecting.load(Ordering::Relaxed) {
        return;
    }

    let take = match limit_samples {
        Some(limit) => {
            let already = pushed.load(Ordering::Relaxed);
            let remaining = limit.saturating_sub(already);
            if remaining < data.len() {
                limit_hit.store(true, Ordering::Relaxed);
                collecting.store(false, Ordering::Relaxed);
            }
            remaining.min(data.len())
        }
        None => data.len(),
    };

    if take == 0 {
        return;
    }

    let accepted = producer.push_slice(&data[..take]);
    pushed.fetch_add(accepted, Ordering::Relaxed);
    if accepted < take {
        warn!("ring buffer full, dropped {} samples", take - accepted);
    }
}

/// Convert interleaved device samples to mono at the target rate
///
/// Channels are averaged; rate conversion is linear interpolation, which is
/// plenty for speech headed into the transcription service.
fn downmix_and_resample(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let mono: Vec<f32> = if channels <= 1 {
        samples.to_vec()
    } else {
        let channels_f64 = f64::from(channels);
        samples
            .chunks(channels as usize)
            .map(|frame| {
                let sum: f64 = frame.iter().map(|&s| f64::from(s)).sum();
                #[allow(clippy::cast_possible_truncation)]
                {
                    (sum / channels_f64) as f32
                }
            })
            .collect()
    };

    if from_rate == to_rate || mono.is_empty() {
        return mono;
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let output_len = ((mono.len() as f64) / ratio).ceil() as usize;

    let mut resampled = Vec::with_capacity(output_len);
    for i in 0..output_len {
        #[allow(clippy::cast_precision_loss)]
        let src_pos = (i as f64) * ratio;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lo = (src_pos.floor() as usize).min(mono.len() - 1);
        let hi = (lo + 1).min(mono.len() - 1);
        let fract = src_pos - src_pos.floor();

        let s1 = f64::from(mono[lo]);
        let s2 = f64::from(mono[hi]);
        #[allow(clippy::cast_possible_truncation)]
        resampled.push(s1.mul_add(1.0 - fract, s2 * fract) as f32);
    }

    resampled
}
