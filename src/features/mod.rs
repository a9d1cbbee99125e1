//! # Feature Extraction Module
//!
//! Turns a conditioned signal into the fixed, named feature vector the emotion
//! model was trained on (58 values with the default 20 cepstral coefficients).
//!
//! ## Feature Groups (in order):
//! - **MFCC**: mean and std per coefficient, interleaved
//! - **RMS**: mean, std, max, range of frame energy
//! - **Pitch**: statistics over voiced frames, zeros when none are voiced
//! - **Spectral shape**: centroid, bandwidth, rolloff, flatness

pub mod extractor;  // Feature vector assembly and schema
pub mod pitch;      // f0 tracking
pub mod spectral;   // STFT, mel filterbank and frame descriptors

pub use extractor::{FeatureExtractor, FeatureSchema, FeatureVector};
