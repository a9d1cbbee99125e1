//! # Emotion Classification Module
//!
//! Maps a feature vector to an `<intensity>_<emotion>` label through a pretrained
//! classifier and turns that label into a severity contribution.
//!
//! ## Model Artifact:
//! A versioned JSON document carrying the classifier, the label list and the exact
//! ordered feature columns it was trained on. Loading fails when those columns do
//! not match what the extractor produces.

pub mod artifact;    // On-disk format and structural validation
pub mod classifier;  // Inference and label scoring

pub use classifier::{emotion_to_score, EmotionModel, EmotionPrediction};
