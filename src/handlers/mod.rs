pub mod config;
pub mod emotion;
pub mod triage;
pub mod upload;

pub use config::*;
pub use emotion::predict_audio;
pub use triage::generate_json;
