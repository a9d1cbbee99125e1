//! Short-time spectra and the per-frame descriptors derived from them.
//!
//! Conventions are the usual speech-analysis ones: centered frames with zero
//! padding, periodic Hann window, Slaney-style mel scale with area-normalized
//! triangles, orthonormal DCT-II for cepstra.

use realfft::RealFftPlanner;

use crate::audio::hann_window;
use crate::error::{AppError, AppResult};

/// Split a signal into centered frames (`n_fft/2` zeros on both sides).
///
/// Produces `1 + len / hop` frames of length `n_fft`.
pub fn centered_frames(signal: &[f32], n_fft: usize, hop: usize) -> Vec<Vec<f32>> {
    let pad = n_fft / 2;
    let mut padded = vec![0.0f32; signal.len() + 2 * pad];
    padded[pad..pad + signal.len()].copy_from_slice(signal);

    let n_frames = 1 + (padded.len() - n_fft) / hop;
    (0..n_frames)
        .map(|f| padded[f * hop..f * hop + n_fft].to_vec())
        .collect()
}

/// Magnitude spectrogram, `frames x (n_fft/2 + 1)`.
pub fn magnitude_spectrogram(signal: &[f32], n_fft: usize, hop: usize) -> AppResult<Vec<Vec<f32>>> {
    let window = hann_window(n_fft);
    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);
    let mut spectrum = fft.make_output_vec();

    centered_frames(signal, n_fft, hop)
        .into_iter()
        .map(|mut frame| {
            frame.iter_mut().zip(&window).for_each(|(s, w)| *s *= w);
            fft.process(&mut frame, &mut spectrum)
                .map_err(|e| AppError::Internal(format!("FFT failed: {}", e)))?;
            Ok(spectrum.iter().map(|c| c.norm()).collect())
        })
        .collect()
}

/// Center frequency of every FFT bin.
pub fn fft_frequencies(sample_rate: u32, n_fft: usize) -> Vec<f32> {
    let step = sample_rate as f32 / n_fft as f32;
    (0..=n_fft / 2).map(|k| k as f32 * step).collect()
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const LOGSTEP: f64 = 0.068_751_777_420_949_12; // ln(6.4) / 27

fn hz_to_mel(hz: f64) -> f64 {
    let min_log_mel = MIN_LOG_HZ / F_SP;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / LOGSTEP
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let min_log_mel = MIN_LOG_HZ / F_SP;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (LOGSTEP * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney mel filterbank, `n_mels x (n_fft/2 + 1)`.
///
/// Each triangle is scaled by `2 / (f_right - f_left)` so that the filters have
/// roughly constant energy per band.
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Vec<Vec<f32>> {
    let fft_freqs: Vec<f64> = (0..=n_fft / 2)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
            let enorm = 2.0 / (right - left);
            fft_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - left) / (center - left);
                    let upper = (right - f) / (right - center);
                    (lower.min(upper).max(0.0) * enorm) as f32
                })
                .collect()
        })
        .collect()
}

/// Apply a filterbank to a power spectrogram.
pub fn apply_filterbank(power: &[Vec<f32>], bank: &[Vec<f32>]) -> Vec<Vec<f32>> {
    power
        .iter()
        .map(|frame| {
            bank.iter()
                .map(|filter| filter.iter().zip(frame).map(|(w, p)| w * p).sum())
                .collect()
        })
        .collect()
}

/// `10·log10(max(x, amin))`, floored at `top_db` below the global peak.
pub fn power_to_db(power: &[Vec<f32>], amin: f32, top_db: f32) -> Vec<Vec<f32>> {
    let mut db: Vec<Vec<f32>> = power
        .iter()
        .map(|frame| frame.iter().map(|&p| 10.0 * p.max(amin).log10()).collect())
        .collect();
    let peak = db.iter().flatten().cloned().fold(f32::NEG_INFINITY, f32::max);
    let floor = peak - top_db;
    for v in db.iter_mut().flatten() {
        *v = v.max(floor);
    }
    db
}

/// First `n_out` coefficients of the orthonormal DCT-II of `input`.
pub fn dct_ortho(input: &[f32], n_out: usize) -> Vec<f32> {
    let n = input.len() as f64;
    (0..n_out)
        .map(|k| {
            let sum: f64 = input
                .iter()
                .enumerate()
                .map(|(i, &x)| x as f64 * (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
                .sum();
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            (sum * scale) as f32
        })
        .collect()
}

/// Weighted mean frequency of one magnitude frame; 0 for an empty frame.
pub fn centroid(frame: &[f32], freqs: &[f32]) -> f32 {
    let total: f32 = frame.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    frame.iter().zip(freqs).map(|(m, f)| m * f).sum::<f32>() / total
}

/// Second-order spread around the centroid; 0 for an empty frame.
pub fn bandwidth(frame: &[f32], freqs: &[f32], centroid: f32) -> f32 {
    let total: f32 = frame.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    frame
        .iter()
        .zip(freqs)
        .map(|(m, f)| (m / total) * (f - centroid).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Lowest frequency below which `percent` of the frame's magnitude lies.
pub fn rolloff(frame: &[f32], freqs: &[f32], percent: f32) -> f32 {
    let total: f32 = frame.iter().sum();
    let threshold = percent * total;
    let mut cumulative = 0.0;
    for (m, &f) in frame.iter().zip(freqs) {
        cumulative += m;
        if cumulative >= threshold {
            return f;
        }
    }
    freqs.last().copied().unwrap_or(0.0)
}

/// Geometric over arithmetic mean of the power spectrum.
///
/// An all-zero frame is perfectly flat (1.0) because every bin sits at `amin`.
pub fn flatness(frame: &[f32], amin: f32) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let n = frame.len() as f64;
    let powers = frame.iter().map(|&m| ((m * m).max(amin)) as f64);
    let (log_sum, sum) = powers.fold((0.0, 0.0), |(l, s), p| (l + p.ln(), s + p));
    ((log_sum / n).exp() / (sum / n)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_frame_count() {
        let frames = centered_frames(&vec![0.0; 22050], 2048, 512);
        assert_eq!(frames.len(), 1 + 22050 / 512);
        assert!(frames.iter().all(|f| f.len() == 2048));
    }

    #[test]
    fn test_mel_scale_roundtrip_points() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((mel_to_hz(hz_to_mel(4321.0)) - 4321.0).abs() < 1e-6);
    }

    #[test]
    fn test_mel_filterbank_shape() {
        let bank = mel_filterbank(16000, 400, 80, 0.0, 8000.0);
        assert_eq!(bank.len(), 80);
        assert!(bank.iter().all(|f| f.len() == 201));
        assert!(bank.iter().all(|f| f.iter().any(|&w| w > 0.0)));
    }

    #[test]
    fn test_dct_of_constant_has_only_dc() {
        let out = dct_ortho(&[2.0; 8], 4);
        assert!((out[0] - 2.0 * 8f32.sqrt()).abs() < 1e-4);
        assert!(out[1..].iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn test_tone_centroid_and_rolloff() {
        let rate = 22050;
        let signal: Vec<f32> = (0..rate)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / rate as f32).sin())
            .collect();
        let spec = magnitude_spectrogram(&signal, 2048, 512).unwrap();
        let freqs = fft_frequencies(rate as u32, 2048);
        let mid = &spec[spec.len() / 2];
        let c = centroid(mid, &freqs);
        assert!((c - 1000.0).abs() < 30.0, "centroid {}", c);
        let r = rolloff(mid, &freqs, 0.85);
        assert!((r - 1000.0).abs() < 30.0, "rolloff {}", r);
        assert!(flatness(mid, 1e-10) < 0.1);
    }

    #[test]
    fn test_empty_frame_descriptors() {
        let zeros = vec![0.0f32; 1025];
        let freqs = fft_frequencies(22050, 2048);
        assert_eq!(centroid(&zeros, &freqs), 0.0);
        assert_eq!(bandwidth(&zeros, &freqs, 0.0), 0.0);
        assert_eq!(rolloff(&zeros, &freqs, 0.85), 0.0);
        assert!((flatness(&zeros, 1e-10) - 1.0).abs() < 1e-6);
    }
}
