/// Microphone capture
pub mod capture;

pub use capture::AudioCapture;

use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

/// Microphone control as the session controller sees it
#[cfg_attr(test, mockall::automock)]
pub trait CaptureDevice {
    /// Begin collecting samples, with an optional safety cutoff
    ///
    /// # Errors
    /// `AlreadyRecording` if a capture is in progress, `Unavailable` if the
    /// device cannot be acquired
    fn start(&mut self, limit: Option<Duration>) -> Result<(), CaptureError>;

    /// Stop collecting and return the captured buffer
    ///
    /// # Errors
    /// `EmptyCapture` if nothing usable was recorded
    fn stop(&mut self) -> Result<AudioBuffer, CaptureError>;

    /// Discard any in-progress capture and release the device
    fn abort(&mut self);

    /// Whether a capture currently holds the device
    fn is_active(&self) -> bool;
}

/// Errors that can occur while capturing audio
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Microphone busy or inaccessible; no session is created
    #[error("microphone unavailable: {source}")]
    Unavailable {
        /// Underlying device error
        source: anyhow::Error,
    },

    /// A capture is already in progress (double-press race)
    #[error("a capture is already in progress")]
    AlreadyRecording,

    /// Stop yielded no usable audio
    #[error("no audio captured")]
    EmptyCapture,
}

/// Captured audio, mono f32 at the configured sample rate
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    truncated: bool,
}

impl AudioBuffer {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32, truncated: bool) -> Self {
        Self {
            samples,
            sample_rate,
            truncated,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the safety cutoff ended this capture early
    #[must_use]
    pub const fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn set_truncated(&mut self, truncated: bool) {
        self.truncated = truncated;
    }

    /// Encode as a 16-bit PCM mono WAV payload for the transcription request
    ///
    /// # Errors
    /// Returns error if the WAV header or samples cannot be written
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &sample in &self.samples {
                // Same scaling the service-side decoder expects for i16 PCM
                #[allow(clippy::cast_possible_truncation)]
                let quantized = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                writer.write_sample(quantized)?;
            }
            writer.finalize()?;
        }

        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_from_sample_count() {
        let buffer = AudioBuffer::new(vec![0.0; 16000], 16000, false);
        assert_eq!(buffer.duration(), Duration::from_secs(1));

        let buffer = AudioBuffer::new(vec![0.0; 8000], 16000, false);
        assert_eq!(buffer.duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = AudioBuffer::new(Vec::new(), 16000, false);
        assert!(buffer.is_empty());
        assert_eq!(buffer.duration(), Duration::ZERO);
    }

    #[test]
    fn test_wav_bytes_round_trip() {
        let buffer = AudioBuffer::new(vec![0.0, 0.5, -0.5, 1.0, -1.0], 16000, false);
        let bytes = buffer.to_wav_bytes().unwrap();

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.sample_format, hound::SampleFormat::Int);

        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![0, 16383, -16383, 32767, -32767]);
    }

    #[test]
    fn test_wav_bytes_clamps_out_of_range() {
        let buffer = AudioBuffer::new(vec![2.0, -3.0], 16000, false);
        let bytes = buffer.to_wav_bytes().unwrap();

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![32767, -32767]);
    }
}
