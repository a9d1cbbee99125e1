//! Fundamental-frequency tracking.
//!
//! Frames are centered the same way as the spectral frames, and each one is
//! handed to the McLeod pitch method. A frame counts as voiced when the detector
//! finds a clear peak and the estimate falls inside `[fmin, fmax]`.

use pitch_detection::detector::mcleod::McLeodDetector;
use pitch_detection::detector::PitchDetector;

use super::spectral::centered_frames;

/// Power threshold for pitch detection
const POWER_THRESHOLD: f32 = 0.8;

/// Clarity threshold for pitch detection
const CLARITY_THRESHOLD: f32 = 0.5;

/// Per-frame f0 track; `None` marks an unvoiced frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PitchTrack {
    pub frames: Vec<Option<f32>>,
}

impl PitchTrack {
    pub fn voiced(&self) -> Vec<f32> {
        self.frames.iter().flatten().copied().collect()
    }

    pub fn voiced_ratio(&self) -> f32 {
        if self.frames.is_empty() {
            return 0.0;
        }
        self.frames.iter().filter(|f| f.is_some()).count() as f32 / self.frames.len() as f32
    }
}

/// Track f0 over centered frames of `frame_len` samples every `hop` samples.
pub fn track(signal: &[f32], sample_rate: u32, frame_len: usize, hop: usize, fmin: f32, fmax: f32) -> PitchTrack {
    let mut detector = McLeodDetector::new(frame_len, frame_len / 2);

    let frames = centered_frames(signal, frame_len, hop)
        .iter()
        .map(|frame| {
            detector
                .get_pitch(frame, sample_rate as usize, POWER_THRESHOLD, CLARITY_THRESHOLD)
                .map(|pitch| pitch.frequency)
                .filter(|&f| f >= fmin && f <= fmax)
        })
        .collect();

    PitchTrack { frames }
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_steady_tone() {
        let rate = 22050;
        let signal: Vec<f32> = (0..rate)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect();
        let track = track(&signal, rate as u32, 2048, 512, 50.0, 600.0);
        let voiced = track.voiced();
        assert!(track.voiced_ratio() > 0.5);
        let mean = voiced.iter().sum::<f32>() / voiced.len() as f32;
        assert!((mean - 220.0).abs() < 5.0, "mean f0 {}", mean);
    }

    #[test]
    fn test_silence_is_unvoiced() {
        let track = track(&vec![0.0; 22050], 22050, 2048, 512, 50.0, 600.0);
        assert!(track.voiced().is_empty());
        assert_eq!(track.voiced_ratio(), 0.0);
    }

    #[test]
    fn test_out_of_range_pitch_is_unvoiced() {
        let rate = 22050;
        let signal: Vec<f32> = (0..rate)
            .map(|i| (2.0 * std::f32::consts::PI * 1500.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect();
        let track = track(&signal, rate as u32, 2048, 512, 50.0, 600.0);
        assert!(track.voiced().iter().all(|&f| (50.0..=600.0).contains(&f)));
    }

    #[test]
    fn test_percentile_linear() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 4.0);
        assert!((percentile(&v, 25.0) - 1.75).abs() < 1e-6);
        assert!((percentile(&v, 75.0) - 3.25).abs() < 1e-6);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
