//! # Stationary Noise Reduction
//!
//! Spectral gating with the whole recording as the noise profile. The STFT
//! magnitude of every bin is compared to that bin's mean + `n_std` standard
//! deviations (in dB, over all frames); bins below the threshold are gated out.
//! The binary mask is smoothed over roughly 500 Hz and 50 ms before it is applied,
//! which avoids the musical-noise artefacts of a hard gate.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use tracing::debug;

use super::hann_window;
use crate::error::{AppError, AppResult};

const N_FFT: usize = 1024;
const HOP: usize = 256;
const FREQ_SMOOTH_HZ: f32 = 500.0;
const TIME_SMOOTH_MS: f32 = 50.0;
const AMIN: f32 = 1e-20;
const TOP_DB: f32 = 80.0;

/// Spectral-gating denoiser for one sample rate.
pub struct SpectralGate {
    sample_rate: u32,
    n_std: f32,
    window: Vec<f32>,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

impl SpectralGate {
    pub fn new(sample_rate: u32, n_std: f32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        Self {
            sample_rate,
            n_std,
            window: hann_window(N_FFT),
            forward: planner.plan_fft_forward(N_FFT),
            inverse: planner.plan_fft_inverse(N_FFT),
        }
    }

    /// Denoise a mono buffer; the output has the same length as the input.
    pub fn process(&self, samples: &[f32]) -> AppResult<Vec<f32>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let mut spectrum = self.stft(samples)?;
        let n_frames = spectrum.len();
        let n_bins = N_FFT / 2 + 1;

        let db: Vec<Vec<f32>> = {
            let mags: Vec<Vec<f32>> = spectrum
                .iter()
                .map(|frame| frame.iter().map(|c| c.norm()).collect())
                .collect();
            amplitude_to_db(&mags)
        };

        // Per-bin statistics across all frames
        let mut threshold = vec![0.0f32; n_bins];
        for (bin, thr) in threshold.iter_mut().enumerate() {
            let mean = db.iter().map(|f| f[bin]).sum::<f32>() / n_frames as f32;
            let var = db.iter().map(|f| (f[bin] - mean).powi(2)).sum::<f32>() / n_frames as f32;
            *thr = mean + self.n_std * var.sqrt();
        }

        let mut mask: Vec<Vec<f32>> = db
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .zip(&threshold)
                    .map(|(&v, &t)| if v > t { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();

        let (freq_kernel, time_kernel) = self.smoothing_kernels();
        smooth_mask(&mut mask, &freq_kernel, &time_kernel);

        let kept: usize = mask.iter().flatten().filter(|&&m| m > 0.5).count();
        debug!(
            "Spectral gate: {} frames x {} bins, {:.1}% of cells kept",
            n_frames,
            n_bins,
            100.0 * kept as f32 / (n_frames * n_bins) as f32
        );

        for (frame, m) in spectrum.iter_mut().zip(&mask) {
            for (c, &g) in frame.iter_mut().zip(m) {
                *c *= g;
            }
        }

        self.istft(spectrum, samples.len())
    }

    /// Centered STFT, zero-padded by half a window on both sides.
    fn stft(&self, samples: &[f32]) -> AppResult<Vec<Vec<Complex<f32>>>> {
        let pad = N_FFT / 2;
        let mut padded = vec![0.0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let n_frames = 1 + (padded.len() - N_FFT) / HOP;
        let mut input = self.forward.make_input_vec();
        let mut frames = Vec::with_capacity(n_frames);

        for f in 0..n_frames {
            let start = f * HOP;
            for (i, slot) in input.iter_mut().enumerate() {
                *slot = padded[start + i] * self.window[i];
            }
            let mut output = self.forward.make_output_vec();
            self.forward
                .process(&mut input, &mut output)
                .map_err(|e| AppError::Internal(format!("FFT failed: {}", e)))?;
            frames.push(output);
        }
        Ok(frames)
    }

    /// Weighted overlap-add inverse of [`Self::stft`].
    fn istft(&self, frames: Vec<Vec<Complex<f32>>>, length: usize) -> AppResult<Vec<f32>> {
        let pad = N_FFT / 2;
        let total = N_FFT + HOP * (frames.len().saturating_sub(1));
        let mut out = vec![0.0f32; total];
        let mut norm = vec![0.0f32; total];
        let mut time = self.inverse.make_output_vec();
        let scale = 1.0 / N_FFT as f32;

        for (f, mut frame) in frames.into_iter().enumerate() {
            // DC and Nyquist must be purely real for the inverse transform
            if let Some(first) = frame.first_mut() {
                first.im = 0.0;
            }
            if let Some(last) = frame.last_mut() {
                last.im = 0.0;
            }
            self.inverse
                .process(&mut frame, &mut time)
                .map_err(|e| AppError::Internal(format!("Inverse FFT failed: {}", e)))?;

            let start = f * HOP;
            for i in 0..N_FFT {
                let w = self.window[i];
                out[start + i] += time[i] * scale * w;
                norm[start + i] += w * w;
            }
        }

        for (sample, &n) in out.iter_mut().zip(&norm) {
            if n > 1e-8 {
                *sample /= n;
            }
        }

        let mut result: Vec<f32> = out.into_iter().skip(pad).take(length).collect();
        result.resize(length, 0.0);
        Ok(result)
    }

    /// Triangular smoothing kernels along frequency and time, each summing to 1.
    fn smoothing_kernels(&self) -> (Vec<f32>, Vec<f32>) {
        let bin_hz = self.sample_rate as f32 / N_FFT as f32 * 2.0;
        let n_freq = (FREQ_SMOOTH_HZ / bin_hz) as usize;
        let frame_ms = HOP as f32 / self.sample_rate as f32 * 1000.0;
        let n_time = (TIME_SMOOTH_MS / frame_ms) as usize;
        (triangle(n_freq), triangle(n_time))
    }
}

/// Rising then falling ramp of half-width `n`, normalized to unit sum.
///
/// `n == 0` yields the identity kernel.
fn triangle(n: usize) -> Vec<f32> {
    if n == 0 {
        return vec![1.0];
    }
    let rise = (1..=n).map(|i| i as f32 / (n + 1) as f32);
    let fall = (0..=n).map(|i| 1.0 - i as f32 / (n + 1) as f32);
    let mut kernel: Vec<f32> = rise.chain(fall).collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Separable "same"-size convolution of the mask with both kernels.
fn smooth_mask(mask: &mut [Vec<f32>], freq_kernel: &[f32], time_kernel: &[f32]) {
    if mask.is_empty() {
        return;
    }
    let n_frames = mask.len();
    let n_bins = mask[0].len();

    if freq_kernel.len() > 1 {
        let half = freq_kernel.len() / 2;
        for frame in mask.iter_mut() {
            let src = frame.clone();
            for (bin, dst) in frame.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, &w) in freq_kernel.iter().enumerate() {
                    let idx = bin as isize + k as isize - half as isize;
                    if idx >= 0 && (idx as usize) < n_bins {
                        acc += w * src[idx as usize];
                    }
                }
                *dst = acc;
            }
        }
    }

    if time_kernel.len() > 1 {
        let half = time_kernel.len() / 2;
        let src: Vec<Vec<f32>> = mask.to_vec();
        for (f, frame) in mask.iter_mut().enumerate() {
            for (bin, dst) in frame.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, &w) in time_kernel.iter().enumerate() {
                    let idx = f as isize + k as isize - half as isize;
                    if idx >= 0 && (idx as usize) < n_frames {
                        acc += w * src[idx as usize][bin];
                    }
                }
                *dst = acc;
            }
        }
    }
}

/// 20·log10 with an amplitude floor and an 80 dB range below the peak.
fn amplitude_to_db(mags: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let mut db: Vec<Vec<f32>> = mags
        .iter()
        .map(|frame| frame.iter().map(|&m| 20.0 * m.max(AMIN).log10()).collect())
        .collect();
    let peak = db.iter().flatten().cloned().fold(f32::NEG_INFINITY, f32::max);
    let floor = peak - TOP_DB;
    for v in db.iter_mut().flatten() {
        *v = v.max(floor);
    }
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::rms;

    /// Deterministic pseudo-random noise
    fn noise(n: usize, amplitude: f32, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                ((state >> 16) as f32 / 32768.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_triangle_kernel() {
        assert_eq!(triangle(0), vec![1.0]);
        let k = triangle(3);
        assert_eq!(k.len(), 7);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(k[3] > k[2] && k[3] > k[4]);
    }

    #[test]
    fn test_length_preserved() {
        let gate = SpectralGate::new(16000, 1.0);
        for len in [1usize, 100, 1024, 5000] {
            let out = gate.process(&noise(len, 0.1, 7)).unwrap();
            assert_eq!(out.len(), len);
        }
        assert!(gate.process(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_reduces_stationary_noise_keeps_loud_burst() {
        let rate = 16000;
        let mut signal = noise(rate as usize * 2, 0.02, 12345);
        // A loud broadband burst in the middle half second
        let burst = noise(8000, 0.5, 999);
        for (i, b) in burst.iter().enumerate() {
            signal[12000 + i] += b;
        }

        let gate = SpectralGate::new(rate, 1.0);
        let out = gate.process(&signal).unwrap();

        let noise_before = rms(&signal[1000..8000]);
        let noise_after = rms(&out[1000..8000]);
        assert!(noise_after < noise_before * 0.7, "{} -> {}", noise_before, noise_after);

        let burst_before = rms(&signal[13000..19000]);
        let burst_after = rms(&out[13000..19000]);
        assert!(burst_after > burst_before * 0.7, "{} -> {}", burst_before, burst_after);
    }
}
