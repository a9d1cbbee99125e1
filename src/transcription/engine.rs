//! # Transcription Engine
//!
//! The seam between the pipeline and whatever turns speech into text.
//!
//! ## Key Responsibilities:
//! - **Transcriber trait**: audio in, text out, so the coordinator can be tested
//!   without a model
//! - **WhisperTranscriber**: the production implementation over [`WhisperModel`]
//! - **Off-loop inference**: decoding runs on the blocking pool, never on the
//!   async executor
//! - **Cancellation**: dropping a pending `transcribe` future raises a flag the
//!   decoder polls, so abandoned requests stop decoding and free the model

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use candle_core::Device;
use candle_transformers::models::whisper as m;

use crate::audio::resample::resample;
use crate::audio::ConditionedSignal;
use crate::error::{AppError, AppResult};
use crate::transcription::model::{ModelSize, WhisperModel};

/// Speech-to-text collaborator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Produce a transcript for a conditioned signal.
    async fn transcribe(&self, signal: &ConditionedSignal) -> AppResult<String>;

    /// Human-readable engine name for health output.
    fn name(&self) -> String;
}

/// Shared stop flag polled by blocking decode work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raises the flag when the awaiting future goes away.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Run `work` on the blocking pool with the model locked.
///
/// `spawn_blocking` closures cannot be aborted, so dropping the returned future
/// instead sets the flag handed to `work`; `work` is expected to poll it and
/// return early, which releases the lock for the next request.
async fn run_locked<M, T, F>(model: &Arc<Mutex<M>>, work: F) -> AppResult<T>
where
    M: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut M, &CancelFlag) -> AppResult<T> + Send + 'static,
{
    let cancel = CancelFlag::default();
    let _guard = CancelOnDrop(cancel.clone());
    let model = Arc::clone(model);

    tokio::task::spawn_blocking(move || {
        let mut model = model
            .lock()
            .map_err(|_| AppError::Internal("Whisper model lock poisoned".to_string()))?;
        if cancel.is_cancelled() {
            return Err(AppError::Internal("Transcription cancelled before it started".to_string()));
        }
        work(&mut model, &cancel)
    })
    .await?
}

/// Whisper running in-process through Candle.
///
/// ## Thread Safety:
/// The model sits behind a `Mutex` because decoding mutates its caches; each
/// request locks it only inside `spawn_blocking`.
pub struct WhisperTranscriber {
    model: Arc<Mutex<WhisperModel>>,
    size: ModelSize,
}

impl WhisperTranscriber {
    /// Download (or reuse the cached) checkpoint and load it.
    pub async fn load(size: ModelSize, language: &str) -> AppResult<Self> {
        let device = Device::cuda_if_available(0)
            .map_err(|e| AppError::ModelLoad(format!("Failed to select device: {}", e)))?;
        tracing::info!("Using device {:?} for transcription", device);

        let language = (!language.is_empty()).then_some(language);
        let model = WhisperModel::load(size, language, device)
            .await
            .map_err(|e| AppError::ModelLoad(format!("Whisper {}: {}", size, e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            size,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, signal: &ConditionedSignal) -> AppResult<String> {
        let whisper_rate = m::SAMPLE_RATE as u32;
        let samples = if signal.sample_rate == whisper_rate {
            signal.samples.clone()
        } else {
            resample(&signal.samples, signal.sample_rate, whisper_rate)?
        };

        run_locked(&self.model, move |model, cancel| {
            model
                .transcribe(&samples, cancel)
                .map_err(|e| AppError::ExternalService(format!("Transcription failed: {}", e)))
        })
        .await
    }

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_run_locked_returns_work_result() {
        let model = Arc::new(Mutex::new(41usize));
        let value = run_locked(&model, |count, cancel| {
            assert!(!cancel.is_cancelled());
            *count += 1;
            Ok(*count)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_dropped_transcription_releases_model() {
        let model = Arc::new(Mutex::new(0usize));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn({
            let model = Arc::clone(&model);
            async move {
                run_locked::<_, (), _>(&model, move |steps, cancel| {
                    let _ = started_tx.send(());
                    // Stands in for a long greedy decode that polls between tokens
                    while !cancel.is_cancelled() {
                        *steps += 1;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(AppError::Internal("cancelled".to_string()))
                })
                .await
            }
        });

        started_rx.await.unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(steps) = model.try_lock() {
                assert!(*steps > 0);
                break;
            }
            assert!(Instant::now() < deadline, "model lock still held after the request was dropped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::default();
        let clone = flag.clone();
        drop(CancelOnDrop(clone));
        assert!(flag.is_cancelled());
    }
}
