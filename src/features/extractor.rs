use serde::Serialize;
use tracing::debug;

use super::pitch::{percentile, track};
use super::spectral::{
    apply_filterbank, bandwidth, centroid, centered_frames, dct_ortho, fft_frequencies, flatness,
    magnitude_spectrogram, mel_filterbank, power_to_db, rolloff,
};
use crate::audio::ConditionedSignal;
use crate::config::FeatureConfig;
use crate::error::{AppError, AppResult};

const N_FFT: usize = 2048;
const HOP: usize = 512;
const N_MELS: usize = 128;
const AMIN: f32 = 1e-10;
const TOP_DB: f32 = 80.0;
const ROLLOFF_PERCENT: f32 = 0.85;

const RMS_NAMES: [&str; 4] = ["rms_mean", "rms_std", "rms_max", "rms_range"];
const PITCH_NAMES: [&str; 8] = [
    "pitch_mean",
    "pitch_std",
    "pitch_min",
    "pitch_max",
    "pitch_25",
    "pitch_75",
    "pitch_range",
    "pitch_voiced_ratio",
];
const SPECTRAL_NAMES: [&str; 6] = [
    "spec_centroid_mean",
    "spec_centroid_std",
    "spec_bandwidth_mean",
    "spec_bandwidth_std",
    "spec_rolloff_mean",
    "spec_flatness_mean",
];

/// Ordered feature names produced by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(n_mfcc: usize) -> Self {
        let mut names = Vec::with_capacity(2 * n_mfcc + 18);
        for i in 1..=n_mfcc {
            names.push(format!("mfcc_mean_{}", i));
            names.push(format!("mfcc_std_{}", i));
        }
        names.extend(RMS_NAMES.iter().map(|s| s.to_string()));
        names.extend(PITCH_NAMES.iter().map(|s| s.to_string()));
        names.extend(SPECTRAL_NAMES.iter().map(|s| s.to_string()));
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Compare against a column list, describing the first disagreement.
    pub fn check(&self, columns: &[String]) -> AppResult<()> {
        if columns.len() != self.names.len() {
            return Err(AppError::Schema(format!(
                "Model expects {} feature columns, extractor produces {}",
                columns.len(),
                self.names.len()
            )));
        }
        if let Some((i, (want, have))) = columns
            .iter()
            .zip(&self.names)
            .enumerate()
            .find(|(_, (want, have))| want != have)
        {
            return Err(AppError::Schema(format!(
                "Feature column {} is '{}' in the model but '{}' in the extractor",
                i, want, have
            )));
        }
        Ok(())
    }
}

/// Named values in schema order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    entries: Vec<(String, f64)>,
}

impl FeatureVector {
    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Values re-ordered to `columns`; any missing name is a schema error.
    pub fn select(&self, columns: &[String]) -> AppResult<Vec<f64>> {
        columns
            .iter()
            .map(|c| {
                self.get(c)
                    .ok_or_else(|| AppError::Schema(format!("Feature '{}' missing from vector", c)))
            })
            .collect()
    }
}

/// Computes the fixed feature set from a conditioned signal.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    schema: FeatureSchema,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let schema = FeatureSchema::new(config.n_mfcc);
        Self { config, schema }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Extract the feature vector from the first `max_duration_secs` of `signal`.
    pub fn extract(&self, signal: &ConditionedSignal) -> AppResult<FeatureVector> {
        let max_len = (signal.sample_rate as f64 * self.config.max_duration_secs) as usize;
        let y = &signal.samples[..signal.samples.len().min(max_len)];
        if y.len() < 2 {
            return Err(AppError::Input(format!(
                "Audio too short for feature extraction: {} sample(s)",
                y.len()
            )));
        }

        let started = std::time::Instant::now();
        let sr = signal.sample_rate;
        let mut values = Vec::with_capacity(self.schema.len());

        let magnitude = magnitude_spectrogram(y, N_FFT, HOP)?;

        // MFCC
        let power: Vec<Vec<f32>> = magnitude
            .iter()
            .map(|frame| frame.iter().map(|m| m * m).collect())
            .collect();
        let bank = mel_filterbank(sr, N_FFT, N_MELS, 0.0, sr as f64 / 2.0);
        let mel_db = power_to_db(&apply_filterbank(&power, &bank), AMIN, TOP_DB);
        let mfcc: Vec<Vec<f32>> = mel_db.iter().map(|frame| dct_ortho(frame, self.config.n_mfcc)).collect();
        for k in 0..self.config.n_mfcc {
            let coeff: Vec<f32> = mfcc.iter().map(|frame| frame[k]).collect();
            let (mean, std) = mean_std(&coeff);
            values.push(mean);
            values.push(std);
        }

        // RMS over time-domain frames
        let rms: Vec<f32> = centered_frames(y, N_FFT, HOP)
            .iter()
            .map(|frame| (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt())
            .collect();
        let (rms_mean, rms_std) = mean_std(&rms);
        let (rms_min, rms_max) = min_max(&rms);
        values.extend([rms_mean, rms_std, rms_max, rms_max - rms_min]);

        // Pitch over voiced frames only
        let pitch = track(y, sr, N_FFT, HOP, self.config.fmin_hz, self.config.fmax_hz);
        let voiced = pitch.voiced();
        if voiced.is_empty() {
            values.extend([0.0; 8]);
        } else {
            let (mean, std) = mean_std(&voiced);
            let (min, max) = min_max(&voiced);
            values.extend([
                mean,
                std,
                min,
                max,
                percentile(&voiced, 25.0) as f64,
                percentile(&voiced, 75.0) as f64,
                max - min,
                pitch.voiced_ratio() as f64,
            ]);
        }

        // Spectral shape
        let freqs = fft_frequencies(sr, N_FFT);
        let centroids: Vec<f32> = magnitude.iter().map(|f| centroid(f, &freqs)).collect();
        let bandwidths: Vec<f32> = magnitude
            .iter()
            .zip(&centroids)
            .map(|(f, &c)| bandwidth(f, &freqs, c))
            .collect();
        let rolloffs: Vec<f32> = magnitude.iter().map(|f| rolloff(f, &freqs, ROLLOFF_PERCENT)).collect();
        let flatnesses: Vec<f32> = magnitude.iter().map(|f| flatness(f, AMIN)).collect();

        let (centroid_mean, centroid_std) = mean_std(&centroids);
        let (bandwidth_mean, bandwidth_std) = mean_std(&bandwidths);
        values.extend([
            centroid_mean,
            centroid_std,
            bandwidth_mean,
            bandwidth_std,
            mean_std(&rolloffs).0,
            mean_std(&flatnesses).0,
        ]);

        debug!(
            "Extracted {} features from {} samples in {:.1}ms ({} voiced pitch frames)",
            values.len(),
            y.len(),
            started.elapsed().as_secs_f64() * 1000.0,
            voiced.len()
        );

        let entries = self.schema.names().iter().cloned().zip(values).collect();
        Ok(FeatureVector { entries })
    }
}

/// Mean and population standard deviation.
fn mean_std(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn min_max(values: &[f32]) -> (f64, f64) {
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if values.is_empty() {
        (0.0, 0.0)
    } else {
        (min as f64, max as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(AppConfig::default().features)
    }

    fn signal(samples: Vec<f32>, sample_rate: u32) -> ConditionedSignal {
        ConditionedSignal { samples, sample_rate }
    }

    #[test]
    fn test_schema_order_and_count() {
        let schema = FeatureSchema::new(20);
        assert_eq!(schema.len(), 58);
        assert_eq!(schema.names()[0], "mfcc_mean_1");
        assert_eq!(schema.names()[1], "mfcc_std_1");
        assert_eq!(schema.names()[39], "mfcc_std_20");
        assert_eq!(schema.names()[40], "rms_mean");
        assert_eq!(schema.names()[51], "pitch_voiced_ratio");
        assert_eq!(schema.names()[57], "spec_flatness_mean");
    }

    #[test]
    fn test_schema_check() {
        let schema = FeatureSchema::new(20);
        assert!(schema.check(schema.names()).is_ok());

        let mut swapped = schema.names().to_vec();
        swapped.swap(0, 1);
        assert!(matches!(schema.check(&swapped), Err(AppError::Schema(_))));

        let short = schema.names()[..57].to_vec();
        assert!(matches!(schema.check(&short), Err(AppError::Schema(_))));
    }

    #[test]
    fn test_too_short_is_input_error() {
        let err = extractor().extract(&signal(vec![0.1], 16000)).unwrap_err();
        assert_eq!(err.kind(), "input_error");
    }

    #[test]
    fn test_silence_yields_zero_pitch_sentinels() {
        let features = extractor().extract(&signal(vec![0.0; 16000], 16000)).unwrap();
        assert_eq!(features.len(), 58);
        for name in PITCH_NAMES {
            let value = features.get(name).unwrap();
            assert_eq!(value, 0.0, "{}", name);
        }
        assert!(features.entries().iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn test_voiced_tone_features() {
        let rate = 16000;
        let samples: Vec<f32> = (0..rate * 2)
            .map(|i| (2.0 * std::f32::consts::PI * 200.0 * i as f32 / rate as f32).sin() * 0.3)
            .collect();
        let features = extractor().extract(&signal(samples, rate as u32)).unwrap();

        let names: Vec<&str> = features.names().collect();
        assert_eq!(names, extractor().schema().names().iter().map(|s| s.as_str()).collect::<Vec<_>>());

        assert!((features.get("pitch_mean").unwrap() - 200.0).abs() < 5.0);
        assert!(features.get("pitch_voiced_ratio").unwrap() > 0.5);
        assert!(features.get("rms_max").unwrap() > 0.2);
        assert!(features.entries().iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn test_truncates_to_max_duration() {
        let mut config = AppConfig::default().features;
        config.max_duration_secs = 0.5;
        let extractor = FeatureExtractor::new(config);

        // Loud first half second, silence afterwards: silence must not count
        let mut samples = vec![0.0f32; 16000 * 3];
        for (i, s) in samples.iter_mut().take(8000).enumerate() {
            *s = (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16000.0).sin() * 0.5;
        }
        let features = extractor.extract(&signal(samples, 16000)).unwrap();
        assert!(features.get("rms_mean").unwrap() > 0.2);
    }

    #[test]
    fn test_select_in_model_order() {
        let features = extractor().extract(&signal(vec![0.0; 4000], 16000)).unwrap();
        let cols = vec!["rms_max".to_string(), "mfcc_mean_1".to_string()];
        let selected = features.select(&cols).unwrap();
        assert_eq!(selected[0], features.get("rms_max").unwrap());
        assert!(features.select(&["nope".to_string()]).is_err());
    }
}
