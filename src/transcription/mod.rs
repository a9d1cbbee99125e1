//! # Transcription Module
//!
//! Speech-to-text for the extraction protocol, using Whisper models through the
//! Candle framework (pure Rust, no whisper.cpp bindings).
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, the default
//! - **small**: ~244MB, better accuracy on noisy calls
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod engine;  // Transcriber trait and Whisper adapter
pub mod model;   // Whisper model loading and decoding

pub use engine::{Transcriber, WhisperTranscriber};
pub use model::ModelSize;
