//! # Pre-emphasis and Band-pass Filtering
//!
//! The band-pass is a Butterworth high-pass cascaded with a Butterworth low-pass,
//! each built from second-order sections, and run forward then backward so the
//! result has zero phase shift. Signal edges are extended by odd reflection before
//! filtering and the filter state is settled on the first padded sample, which
//! keeps start-up transients out of the returned samples.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, Hertz, Type};
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Normalized-frequency floor for the low edge
const MIN_NORMALIZED_LOW: f64 = 1e-5;
/// Normalized-frequency ceiling for the high edge
const MAX_NORMALIZED_HIGH: f64 = 0.999;
/// Fraction of the sample rate the high edge may reach
const HIGHCUT_RATE_FRACTION: f64 = 0.45;

/// First-order pre-emphasis: `y[0] = x[0]`, `y[n] = x[n] - alpha * x[n-1]`.
pub fn preemphasis(samples: &[f32], alpha: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    if let Some(&first) = samples.first() {
        out.push(first);
    }
    out.extend(samples.windows(2).map(|w| w[1] - alpha * w[0]));
    out
}

/// A validated Butterworth band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandEdges {
    /// Low edge as a fraction of Nyquist
    pub low: f64,
    /// High edge as a fraction of Nyquist
    pub high: f64,
}

impl BandEdges {
    /// Normalize cutoffs in Hz against a sample rate.
    ///
    /// The high cutoff is first limited to 0.45 of the sample rate. Fails unless
    /// `0 < low < high < 1` after normalization.
    pub fn new(lowcut_hz: f64, highcut_hz: f64, sample_rate: u32) -> AppResult<Self> {
        if sample_rate == 0 {
            return Err(AppError::Configuration("Band-pass needs a non-zero sample rate".to_string()));
        }
        let nyquist = sample_rate as f64 / 2.0;
        let highcut_hz = highcut_hz.min(HIGHCUT_RATE_FRACTION * sample_rate as f64);

        let low = (lowcut_hz / nyquist).max(MIN_NORMALIZED_LOW);
        let high = (highcut_hz / nyquist).min(MAX_NORMALIZED_HIGH);

        if !(low > 0.0 && low < high && high < 1.0) {
            return Err(AppError::Configuration(format!(
                "Invalid band-pass edges: low={:.5}, high={:.5} (normalized; need 0 < low < high < 1)",
                low, high
            )));
        }
        Ok(Self { low, high })
    }
}

/// Zero-phase Butterworth band-pass.
pub struct BandPassFilter {
    sections: Vec<Coefficients<f64>>,
    order: usize,
    sample_rate: u32,
    lowcut_hz: f64,
}

impl BandPassFilter {
    /// Design a band-pass of the given order for each edge.
    pub fn new(lowcut_hz: f64, highcut_hz: f64, order: usize, sample_rate: u32) -> AppResult<Self> {
        if order == 0 || order % 2 != 0 {
            return Err(AppError::Configuration(format!(
                "Butterworth order must be a positive even number, got {}",
                order
            )));
        }

        let edges = BandEdges::new(lowcut_hz, highcut_hz, sample_rate)?;
        let nyquist = sample_rate as f64 / 2.0;
        let fs = hertz(sample_rate as f64)?;
        let f_low = hertz(edges.low * nyquist)?;
        let f_high = hertz(edges.high * nyquist)?;

        let mut sections = Vec::with_capacity(order);
        for q in butterworth_q(order) {
            sections.push(section(Type::HighPass, fs, f_low, q)?);
        }
        for q in butterworth_q(order) {
            sections.push(section(Type::LowPass, fs, f_high, q)?);
        }

        debug!(
            "Band-pass designed: {:.1}-{:.1} Hz, order {}, {} sections at {} Hz",
            edges.low * nyquist,
            edges.high * nyquist,
            order,
            sections.len(),
            sample_rate
        );

        Ok(Self {
            sections,
            order,
            sample_rate,
            lowcut_hz: edges.low * nyquist,
        })
    }

    /// Edge padding length used for forward-backward filtering.
    ///
    /// Three times the tap count of the equivalent transfer function.
    pub fn pad_len(&self) -> usize {
        3 * (2 * self.order + 1)
    }

    /// Filter forward then backward.
    pub fn filtfilt(&self, samples: &[f32]) -> Vec<f32> {
        if samples.len() < 2 {
            return samples.to_vec();
        }

        let pad = self.pad_len().min(samples.len() - 1);
        let mut buf = odd_extend(samples, pad);

        self.run(&mut buf);
        buf.reverse();
        self.run(&mut buf);
        buf.reverse();

        buf[pad..pad + samples.len()].iter().map(|&v| v as f32).collect()
    }

    /// One causal pass through every section, settled on the first sample.
    fn run(&self, buf: &mut [f64]) {
        let settle = self.settle_len();
        for coeffs in &self.sections {
            let mut stage = DirectForm2Transposed::<f64>::new(*coeffs);
            if let Some(&first) = buf.first() {
                for _ in 0..settle {
                    stage.run(first);
                }
            }
            for sample in buf.iter_mut() {
                *sample = stage.run(*sample);
            }
        }
    }

    /// Samples of constant input needed for the slowest section to reach steady state.
    fn settle_len(&self) -> usize {
        let periods = 8.0;
        ((self.sample_rate as f64 / self.lowcut_hz.max(1.0)) * periods).ceil() as usize
    }
}

/// Q of each second-order section of an even-order Butterworth filter.
fn butterworth_q(order: usize) -> impl Iterator<Item = f64> {
    (0..order / 2).map(move |k| {
        let theta = std::f64::consts::PI * (2 * k + 1) as f64 / (2 * order) as f64;
        1.0 / (2.0 * theta.cos())
    })
}

fn hertz(hz: f64) -> AppResult<Hertz<f64>> {
    Hertz::<f64>::from_hz(hz).map_err(|e| AppError::Configuration(format!("Invalid frequency {}: {:?}", hz, e)))
}

fn section(kind: Type<f64>, fs: Hertz<f64>, f0: Hertz<f64>, q: f64) -> AppResult<Coefficients<f64>> {
    Coefficients::<f64>::from_params(kind, fs, f0, q)
        .map_err(|e| AppError::Configuration(format!("Failed to design filter section: {:?}", e)))
}

/// Odd extension: `2*x[0] - x[pad..1]` in front, `2*x[n-1] - x[n-2..n-1-pad]` behind.
fn odd_extend(samples: &[f32], pad: usize) -> Vec<f64> {
    let n = samples.len();
    let first = samples[0] as f64;
    let last = samples[n - 1] as f64;

    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - samples[i] as f64));
    out.extend(samples.iter().map(|&s| s as f64));
    out.extend((1..=pad).map(|i| 2.0 * last - samples[n - 1 - i] as f64));
    out
}
