//! # Audio Conditioning Module
//!
//! Turns an uploaded recording into the canonical signal every other stage consumes.
//!
//! ## Key Components:
//! - **Loader**: WAV and compressed container decoding to interleaved f32 frames
//! - **Resampler**: band-limited sinc/FFT resampling to the pipeline rate
//! - **Denoiser**: stationary spectral gating
//! - **Filters**: pre-emphasis and zero-phase Butterworth band-pass
//! - **Processor**: the fixed stage order that ties them together
//!
//! ## Canonical Signal:
//! - **Channels**: Mono (1 channel)
//! - **Format**: 32-bit float, nominally in [-1.0, 1.0]
//! - **Sample Rate**: `audio.target_sample_rate` (16 kHz by default)

pub mod denoise;    // Spectral-gating noise reduction
pub mod filter;     // Pre-emphasis and band-pass
pub mod loader;     // Container decoding
pub mod processor;  // Conditioning stage order
pub mod resample;   // Sample-rate conversion

pub use processor::SignalConditioner;

/// An uploaded recording before any decoding.
///
/// Owned by one request and dropped as soon as conditioning has produced a
/// [`ConditionedSignal`].
#[derive(Debug, Clone)]
pub struct RawAudio {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: Option<String>,
}

impl RawAudio {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>, file_name: Option<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
            file_name,
        }
    }
}

/// Mono samples at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedSignal {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl ConditionedSignal {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Root-mean-square amplitude, accumulated in f64.
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Periodic Hann window of length `n`.
pub(crate) fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
        .collect()
}
