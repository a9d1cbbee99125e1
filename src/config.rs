//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, MISTRAL_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_AUDIO__TARGET_RMS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The audio and feature defaults are tied to the trained emotion model: changing
//! them changes the numbers the classifier sees.

use anyhow::Result;                   // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                         // For reading environment variables

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each pipeline stage only receives the section it needs, so the DSP code never
/// sees server or agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub features: FeatureConfig,
    pub severity: SeverityConfig,
    pub agent: AgentConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Model configuration settings.
///
/// ## Fields:
/// - `whisper_model`: Whisper size used for transcription ("tiny", "base", "small", "medium", "large")
/// - `whisper_language`: Language hint passed to the decoder
/// - `emotion_model_path`: Versioned JSON artifact for the emotion classifier
/// - `llm_model`: Chat model that drives the extraction tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub whisper_language: String,
    pub emotion_model_path: String,
    pub llm_model: String,
}

/// Signal conditioning parameters.
///
/// ## Stage order (fixed):
/// load → mono → resample → RMS-normalize → trim → denoise → pre-emphasis → band-pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate every conditioned signal ends up at (Hz)
    pub target_sample_rate: u32,
    /// RMS level the normalizer scales to
    pub target_rms: f32,
    /// Absolute amplitude below which leading/trailing samples are trimmed
    pub silence_threshold: f32,
    /// Standard deviations above the noise mean a bin must reach to survive denoising
    pub denoise_std_threshold: f32,
    /// Pre-emphasis coefficient
    pub preemphasis: f32,
    /// Band-pass low cutoff (Hz)
    pub lowcut_hz: f64,
    /// Band-pass high cutoff (Hz), further limited to 0.45 × sample rate
    pub highcut_hz: f64,
    /// Butterworth order for each band edge
    pub filter_order: usize,
    /// Sample rate used by the classifier-only path
    pub classifier_sample_rate: u32,
}

/// Feature extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub n_mfcc: usize,
    pub max_duration_secs: f64,
    pub fmin_hz: f32,
    pub fmax_hz: f32,
}

/// Severity aggregation parameters.
///
/// `emotion_weight` blends the vocal-emotion contribution into the triage score.
/// At 0.0 the score is exactly the categorical formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityConfig {
    pub emotion_weight: f64,
}

/// Language-model tool runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of an OpenAI-compatible chat completions API
    pub api_base: String,
    /// Bearer token (usually supplied through MISTRAL_API_KEY)
    pub api_key: String,
    /// Upper bound on model round-trips per request
    pub max_turns: usize,
    /// Per-call HTTP timeout
    pub timeout_secs: u64,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Every pipeline request holds one Whisper inference and one LLM conversation,
///   so `max_concurrent_requests` should track available CPU cores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_requests: usize,
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            models: ModelsConfig {
                whisper_model: "base".to_string(),
                whisper_language: "en".to_string(),
                emotion_model_path: "models/emotion_model.json".to_string(),
                llm_model: "mistral-small-latest".to_string(),
            },
            audio: AudioConfig {
                target_sample_rate: 16000,  // Whisper's native rate
                target_rms: 0.1,            // About -20 dBFS
                silence_threshold: 0.01,
                denoise_std_threshold: 1.0,
                preemphasis: 0.97,
                lowcut_hz: 80.0,
                highcut_hz: 8000.0,         // Clamped to 7200 Hz at 16 kHz
                filter_order: 4,
                classifier_sample_rate: 22050,
            },
            features: FeatureConfig {
                n_mfcc: 20,
                max_duration_secs: 5.0,
                fmin_hz: 50.0,
                fmax_hz: 600.0,
            },
            severity: SeverityConfig {
                emotion_weight: 0.0,
            },
            agent: AgentConfig {
                api_base: "https://api.mistral.ai/v1".to_string(),
                api_key: String::new(),
                max_turns: 6,
                timeout_secs: 60,
            },
            performance: PerformanceConfig {
                max_concurrent_requests: 4,
                max_upload_bytes: 25 * 1024 * 1024,  // 25 MB covers several minutes of WAV
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__WHISPER_MODEL=small`: Override whisper model
    /// - `APP_SEVERITY__EMOTION_WEIGHT=0.2`: Blend in vocal emotion
    /// - `HOST`, `PORT`: Special cases for deployment platforms
    /// - `MISTRAL_API_KEY`: Key for the extraction agent
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("MISTRAL_API_KEY") {
            settings = settings.set_override("agent.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port and request limits are non-zero
    /// - Sample rates and cutoffs are positive
    /// - The Butterworth order can be split into second-order sections
    /// - The emotion weight is a proper blend factor
    ///
    /// Band-edge ordering is checked again per signal, because the high cutoff
    /// depends on the sample rate of the signal being filtered.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("Max concurrent requests must be greater than 0"));
        }

        if self.performance.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        if self.audio.target_sample_rate == 0 || self.audio.classifier_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.target_rms <= 0.0 {
            return Err(anyhow::anyhow!("Target RMS must be positive"));
        }

        if self.audio.lowcut_hz <= 0.0 || self.audio.highcut_hz <= 0.0 {
            return Err(anyhow::anyhow!("Band-pass cutoffs must be positive"));
        }

        if self.audio.filter_order == 0 || self.audio.filter_order % 2 != 0 {
            return Err(anyhow::anyhow!(
                "Filter order must be a positive even number, got {}",
                self.audio.filter_order
            ));
        }

        if self.features.n_mfcc == 0 || self.features.max_duration_secs <= 0.0 {
            return Err(anyhow::anyhow!("Feature extraction needs n_mfcc > 0 and a positive duration"));
        }

        if self.features.fmin_hz <= 0.0 || self.features.fmin_hz >= self.features.fmax_hz {
            return Err(anyhow::anyhow!(
                "Pitch range must satisfy 0 < fmin < fmax, got {}..{}",
                self.features.fmin_hz,
                self.features.fmax_hz
            ));
        }

        if !(0.0..=1.0).contains(&self.severity.emotion_weight) {
            return Err(anyhow::anyhow!(
                "Emotion weight must be within [0, 1], got {}",
                self.severity.emotion_weight
            ));
        }

        if self.agent.max_turns == 0 {
            return Err(anyhow::anyhow!("Agent needs at least one turn"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the tunable sections are accepted: severity blending, agent turn budget
    /// and the request limit. Audio and feature settings are tied to the loaded model
    /// and the server address is fixed once bound, so those are ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(severity) = partial_config.get("severity") {
            if let Some(weight) = severity.get("emotion_weight").and_then(|v| v.as_f64()) {
                self.severity.emotion_weight = weight;
            }
        }

        if let Some(agent) = partial_config.get("agent") {
            if let Some(turns) = agent.get("max_turns").and_then(|v| v.as_u64()) {
                self.agent.max_turns = turns as usize;
            }
            if let Some(timeout) = agent.get("timeout_secs").and_then(|v| v.as_u64()) {
                self.agent.timeout_secs = timeout;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(requests) = performance.get("max_concurrent_requests").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_requests = requests as usize;
            }
            if let Some(bytes) = performance.get("max_upload_bytes").and_then(|v| v.as_u64()) {
                self.performance.max_upload_bytes = bytes as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
