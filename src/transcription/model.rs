//! # Whisper Model
//!
//! Loads a Whisper checkpoint from the Hugging Face hub with Candle and runs
//! greedy decoding over 30-second mel segments.
//!
//! ## Model Loading Process:
//! 1. Resolve config, tokenizer and safetensors weights through `hf-hub` (cached locally)
//! 2. Build the mel filterbank for the checkpoint's mel-bin count
//! 3. Map the weights onto the selected device
//! 4. Look up the special tokens in the tokenizer vocabulary
//!
//! ## Decoding:
//! `<|startoftranscript|> <|lang|> <|transcribe|> <|notimestamps|>` primes the
//! decoder, then the arg-max token is appended until `<|endoftext|>` or the
//! context limit. Suppressed tokens from the model config are masked out.

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use tokenizers::Tokenizer;

use crate::features::spectral::mel_filterbank;
use crate::transcription::engine::CancelFlag;

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// Larger checkpoints transcribe noisy emergency calls more reliably but take
/// proportionally longer on CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Token ids the decoder needs, resolved from the tokenizer.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    eot: u32,
    no_timestamps: u32,
    language: Option<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer, language: Option<&str>) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no '{}' token", token))
        };
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            // English-only checkpoints have no language tokens
            language: language.and_then(|lang| tokenizer.token_to_id(&format!("<|{}|>", lang))),
        })
    }

    fn prompt(&self) -> Vec<u32> {
        let mut tokens = vec![self.sot];
        tokens.extend(self.language);
        tokens.push(self.transcribe);
        tokens.push(self.no_timestamps);
        tokens
    }
}

/// A loaded Whisper model ready for transcription.
///
/// ## Thread Safety:
/// Decoding mutates the key/value caches, so callers hold it behind a mutex and
/// run it on the blocking pool.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    /// Flattened `num_mel_bins x (N_FFT/2 + 1)` filterbank
    mel_filters: Vec<f32>,
    /// Additive logit mask, `-inf` on suppressed tokens
    suppress: Tensor,
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace.
    ///
    /// ## Parameters:
    /// - **size**: Which model size to load
    /// - **language**: Language hint ("en", "es", ...), ignored by English-only checkpoints
    /// - **device**: Device to load the model on (CPU/GPU)
    pub async fn load(size: ModelSize, language: Option<&str>, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;

            let mut builder = ApiBuilder::new().with_progress(false);
            if let Ok(token) = std::env::var("HF_TOKEN") {
                builder = builder.with_token(Some(token));
            }
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            } else if let Ok(hf_home) = std::env::var("HF_HOME") {
                builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
            }
            builder
                .build()
                .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))?
        };

        let repo = api.model(size.repo_name().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        tracing::debug!("Model config: {:?}", config);

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer, language)?;

        let mel_filters = Self::mel_filters(&config);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let suppress = Self::suppress_mask(&config, tokens.no_timestamps, &device)?;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            tokens,
            mel_filters,
            suppress,
        })
    }

    /// Slaney mel filterbank matching the one Whisper was trained with.
    fn mel_filters(config: &Config) -> Vec<f32> {
        let n_mels = config.num_mel_bins;
        mel_filterbank(m::SAMPLE_RATE as u32, m::N_FFT, n_mels, 0.0, m::SAMPLE_RATE as f64 / 2.0)
            .into_iter()
            .flatten()
            .collect()
    }

    fn suppress_mask(config: &Config, no_timestamps: u32, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) || i == no_timestamps {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        Ok(Tensor::new(mask.as_slice(), device)?)
    }

    /// Transcribe 16 kHz mono samples.
    ///
    /// `cancel` is polled before every segment and every decoded token; once
    /// set, decoding stops with an error and the caller's lock is released.
    pub fn transcribe(&mut self, pcm: &[f32], cancel: &CancelFlag) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        let start_time = std::time::Instant::now();

        let mel = audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;

        let mut pieces = Vec::new();
        let mut seek = 0;
        while seek < n_frames {
            if cancel.is_cancelled() {
                bail!("Transcription cancelled after {} of {} frames", seek, n_frames);
            }
            let segment_size = usize::min(n_frames - seek, m::N_FRAMES);
            let segment = mel.narrow(2, seek, segment_size)?;
            let tokens = self.decode_segment(&segment, cancel)?;
            let text = self
                .tokenizer
                .decode(&tokens, true)
                .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
            let text = text.trim();
            if !text.is_empty() {
                pieces.push(text.to_string());
            }
            seek += segment_size;
        }

        let transcript = pieces.join(" ");
        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s ({} chars)",
            pcm.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            transcript.len()
        );
        Ok(transcript)
    }

    /// Greedy decoding of one mel segment; returns the generated tokens only.
    fn decode_segment(&mut self, mel: &Tensor, cancel: &CancelFlag) -> Result<Vec<u32>> {
        let audio_features = self.model.encoder.forward(mel, true)?;
        let prompt = self.tokens.prompt();
        let mut tokens = prompt.clone();
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            if cancel.is_cancelled() {
                bail!("Transcription cancelled mid-segment");
            }
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next_token == self.tokens.eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            tokens.push(next_token);
        }

        Ok(tokens[prompt.len()..].to_vec())
    }
}
