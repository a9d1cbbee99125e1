//! # Signal Conditioning
//!
//! Applies the fixed conditioning chain to an uploaded recording so that both the
//! feature extractor and the transcription engine see the same canonical signal.
//!
//! ## Stage Order:
//! 1. **Load**: decode the container to interleaved f32
//! 2. **Mono-mix**: average channels
//! 3. **Resample**: convert to the target rate
//! 4. **RMS-normalize**: scale to a fixed loudness
//! 5. **Trim**: drop quiet leading/trailing samples
//! 6. **Denoise**: stationary spectral gating
//! 7. **Pre-emphasis**: boost high frequencies
//! 8. **Band-pass**: zero-phase Butterworth
//!
//! The order matters: the emotion model was trained on features computed from
//! exactly this chain, so moving a stage changes every downstream number.

use tracing::debug;

use super::denoise::SpectralGate;
use super::filter::{preemphasis, BandPassFilter};
use super::loader::{load, mix_to_mono};
use super::resample::resample;
use super::{rms, ConditionedSignal, RawAudio};
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};

/// RMS below which normalization leaves the signal alone
const SILENCE_RMS: f64 = 1e-8;

/// Runs the conditioning chain with one set of parameters.
///
/// ## Purpose:
/// Built once from [`AudioConfig`] at startup and shared read-only by every
/// request. All methods are pure with respect to `self`.
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    config: AudioConfig,
}

impl SignalConditioner {
    /// Create a conditioner, checking that the band-pass can be designed at the
    /// target rate.
    pub fn new(config: AudioConfig) -> AppResult<Self> {
        BandPassFilter::new(
            config.lowcut_hz,
            config.highcut_hz,
            config.filter_order,
            config.target_sample_rate,
        )?;
        Ok(Self { config })
    }

    /// Run the full chain at the configured target rate.
    pub fn condition(&self, raw: &RawAudio) -> AppResult<ConditionedSignal> {
        self.condition_at(raw, self.config.target_sample_rate)
    }

    /// Run the full chain at an explicit target rate.
    ///
    /// ## Returns:
    /// - **Ok(ConditionedSignal)**: mono signal at `target_rate`
    /// - **Err(AppError::Input)**: upload could not be decoded
    /// - **Err(AppError::Configuration)**: band-pass edges invalid at `target_rate`
    pub fn condition_at(&self, raw: &RawAudio, target_rate: u32) -> AppResult<ConditionedSignal> {
        let started = std::time::Instant::now();
        let cfg = &self.config;

        let canonical = self.canonicalize(raw, target_rate)?;
        let mut samples = canonical.samples;

        samples = rms_normalize(&samples, cfg.target_rms);
        samples = trim_silence(&samples, cfg.silence_threshold);
        samples = SpectralGate::new(target_rate, cfg.denoise_std_threshold).process(&samples)?;
        samples = preemphasis(&samples, cfg.preemphasis);

        let band = BandPassFilter::new(cfg.lowcut_hz, cfg.highcut_hz, cfg.filter_order, target_rate)?;
        samples = band.filtfilt(&samples);

        debug!(
            "Conditioned {} samples at {} Hz in {:.1}ms",
            samples.len(),
            target_rate,
            started.elapsed().as_secs_f64() * 1000.0
        );

        Ok(ConditionedSignal {
            samples,
            sample_rate: target_rate,
        })
    }

    /// Load, mono-mix and resample only.
    ///
    /// Used by the classifier-only path, whose model was trained on signals that
    /// never went through the enhancement stages.
    pub fn canonicalize(&self, raw: &RawAudio, target_rate: u32) -> AppResult<ConditionedSignal> {
        if target_rate == 0 {
            return Err(AppError::Configuration("Target sample rate must be non-zero".to_string()));
        }

        let decoded = load(raw)?;
        let mono = mix_to_mono(&decoded);
        let samples = resample(&mono, decoded.sample_rate, target_rate)?;

        debug!(
            "Canonicalized {} Hz x{} -> {} samples at {} Hz",
            decoded.sample_rate,
            decoded.channels,
            samples.len(),
            target_rate
        );

        Ok(ConditionedSignal {
            samples,
            sample_rate: target_rate,
        })
    }
}

/// Scale so that the RMS equals `target_rms`.
///
/// Signals quieter than 1e-8 RMS are returned unchanged.
pub fn rms_normalize(samples: &[f32], target_rms: f32) -> Vec<f32> {
    let current = rms(samples);
    if current < SILENCE_RMS {
        return samples.to_vec();
    }
    let gain = (target_rms as f64 / current) as f32;
    samples.iter().map(|&s| s * gain).collect()
}

/// Drop leading and trailing samples below `threshold` in absolute value.
///
/// A buffer with no sample at or above the threshold comes back unchanged.
pub fn trim_silence(samples: &[f32], threshold: f32) -> Vec<f32> {
    let loud = |s: &f32| s.abs() >= threshold;
    match (samples.iter().position(loud), samples.iter().rposition(loud)) {
        (Some(start), Some(end)) => samples[start..=end].to_vec(),
        _ => samples.to_vec(),
    }
}
