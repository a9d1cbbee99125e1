//! # Triage Pipeline
//!
//! Per-request orchestration from uploaded audio to a severity score.
//!
//! ## Flow:
//! ```text
//! RawAudio ─▶ condition ─┬─▶ features ─▶ emotion          (optional)
//!                        └─▶ coordinator + tool runtime ─▶ committed fields
//!                                                        ─▶ severity score
//! ```
//!
//! ## Concurrency:
//! - A semaphore bounds how many calls are processed at once
//! - CPU-bound stages run on the blocking pool
//! - The two branches run concurrently; each is a spawned task held by an
//!   abort-on-drop guard, so a dropped request stops its outstanding work

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audio::{ConditionedSignal, RawAudio, SignalConditioner};
use crate::emotion::{EmotionModel, EmotionPrediction};
use crate::error::{AppError, AppResult};
use crate::features::FeatureExtractor;
use crate::transcription::Transcriber;
use crate::triage::{severity, ExtractionCoordinator, ToolRuntime, TriageFields};

/// Aborts the wrapped task when dropped before completion.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

fn spawn_guarded<F>(future: F) -> AbortOnDrop<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AbortOnDrop(tokio::spawn(future))
}

/// Emotion fields attached to a triage report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionSummary {
    pub predicted_label: String,
    pub score: f64,
}

/// Result of the primary pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriageReport {
    pub transcript: String,
    pub triage_data: TriageFields,
    pub severity_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionSummary>,
}

/// Result of the classifier-only path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub predicted_label: String,
    pub class_probabilities: Vec<f64>,
    pub score: f64,
}

impl From<EmotionPrediction> for ClassificationReport {
    fn from(prediction: EmotionPrediction) -> Self {
        Self {
            predicted_label: prediction.label,
            class_probabilities: prediction.probabilities,
            score: prediction.score,
        }
    }
}

/// Everything one request needs, built once at startup and shared read-only.
pub struct TriagePipeline {
    conditioner: Arc<SignalConditioner>,
    extractor: Arc<FeatureExtractor>,
    emotion: Option<Arc<EmotionModel>>,
    transcriber: Arc<dyn Transcriber>,
    runtime: Arc<dyn ToolRuntime>,
    permits: Arc<Semaphore>,
    /// Semaphore size fixed at startup
    slots: usize,
    classifier_sample_rate: u32,
}

impl TriagePipeline {
    pub fn new(
        conditioner: SignalConditioner,
        extractor: FeatureExtractor,
        emotion: Option<EmotionModel>,
        transcriber: Arc<dyn Transcriber>,
        runtime: Arc<dyn ToolRuntime>,
        max_concurrent_requests: usize,
        classifier_sample_rate: u32,
    ) -> Self {
        let slots = max_concurrent_requests.max(1);
        Self {
            conditioner: Arc::new(conditioner),
            extractor: Arc::new(extractor),
            emotion: emotion.map(Arc::new),
            transcriber,
            runtime,
            permits: Arc::new(Semaphore::new(slots)),
            slots,
            classifier_sample_rate,
        }
    }

    pub fn emotion_model(&self) -> Option<&EmotionModel> {
        self.emotion.as_deref()
    }

    pub fn transcriber_name(&self) -> String {
        self.transcriber.name()
    }

    pub fn runtime_name(&self) -> String {
        self.runtime.name()
    }

    /// Number of requests that may run at once.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Calls currently holding a pipeline slot.
    pub fn in_flight(&self) -> usize {
        self.slots.saturating_sub(self.permits.available_permits())
    }

    /// Run the full pipeline on one call recording.
    ///
    /// ## Errors:
    /// - **Input/Configuration**: conditioning failed
    /// - **ExternalService**: transcription or language model failed
    /// - **Extraction/Validation**: no valid triage record was committed
    pub async fn run(&self, request_id: Uuid, raw: RawAudio, emotion_weight: f64) -> AppResult<TriageReport> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::Internal("Pipeline is shutting down".to_string()))?;
        let start_time = std::time::Instant::now();

        let conditioner = Arc::clone(&self.conditioner);
        let signal = tokio::task::spawn_blocking(move || conditioner.condition(&raw)).await??;
        debug!(
            "Request {}: conditioned {:.2}s of audio at {} Hz",
            request_id,
            signal.duration_secs(),
            signal.sample_rate
        );
        let signal = Arc::new(signal);

        let emotion_branch = self.emotion.clone().map(|model| {
            let extractor = Arc::clone(&self.extractor);
            let signal = Arc::clone(&signal);
            spawn_guarded(async move {
                let prediction: AppResult<EmotionPrediction> = tokio::task::spawn_blocking(move || {
                    let features = extractor.extract(&signal)?;
                    model.classify(&features)
                })
                .await?;
                prediction
            })
        });

        let transcriber = Arc::clone(&self.transcriber);
        let runtime = Arc::clone(&self.runtime);
        let audio = Arc::clone(&signal);
        let extraction_branch = spawn_guarded(async move {
            let mut coordinator = ExtractionCoordinator::new(request_id, transcriber);
            if let Err(err) = runtime.run(audio, &mut coordinator).await {
                coordinator.fail(err);
            }
            coordinator.finish()
        });

        let emotion_future = async {
            let prediction: Option<EmotionPrediction> = match emotion_branch {
                Some(branch) => Some(branch.await??),
                None => None,
            };
            Ok::<_, AppError>(prediction)
        };
        let extraction_future = async { Ok::<_, AppError>(extraction_branch.await??) };

        let (emotion, extraction) = tokio::try_join!(emotion_future, extraction_future)?;

        let severity_score = severity::score(
            &extraction.fields,
            emotion.as_ref().map(|e| e.score),
            emotion_weight,
        );

        info!(
            "Request {}: {} (severity {:.2}) in {:.2}s",
            request_id,
            extraction.fields.event,
            severity_score,
            start_time.elapsed().as_secs_f64()
        );

        Ok(TriageReport {
            transcript: extraction.transcript,
            triage_data: extraction.fields,
            severity_score,
            emotion: emotion.map(|e| EmotionSummary {
                predicted_label: e.label,
                score: e.score,
            }),
        })
    }

    /// Classifier-only path: canonical signal, features, emotion.
    pub async fn classify(&self, raw: RawAudio) -> AppResult<ClassificationReport> {
        let model = self
            .emotion
            .clone()
            .ok_or_else(|| AppError::ModelLoad("No emotion model is loaded".to_string()))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::Internal("Pipeline is shutting down".to_string()))?;

        let conditioner = Arc::clone(&self.conditioner);
        let extractor = Arc::clone(&self.extractor);
        let rate = self.classifier_sample_rate;
        let prediction = tokio::task::spawn_blocking(move || {
            let signal: ConditionedSignal = conditioner.canonicalize(&raw, rate)?;
            drop(raw);
            let features = extractor.extract(&signal)?;
            model.classify(&features)
        })
        .await??;

        Ok(prediction.into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::audio::loader::tests::wav_bytes;
    use crate::config::AppConfig;
    use crate::emotion::artifact::tests::stump_artifact;
    use crate::triage::coordinator::tests::{FixedTranscriber, SHOOTING_JSON};
    use crate::triage::coordinator::{CommitRequest, TranscribeRequest};
    use crate::triage::fields::Event;

    /// Scripted stand-in for the language model: transcribe, then commit `json`.
    pub(crate) struct ScriptedRuntime {
        pub json: Option<String>,
    }

    #[async_trait]
    impl ToolRuntime for ScriptedRuntime {
        async fn run(&self, audio: Arc<ConditionedSignal>, coordinator: &mut ExtractionCoordinator) -> AppResult<()> {
            let transcript = coordinator.transcribe(TranscribeRequest { audio }).await?.transcript;
            if let Some(json) = &self.json {
                coordinator.commit(CommitRequest {
                    transcript,
                    json_object: json.clone(),
                });
            }
            Ok(())
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Never finishes; records whether it was dropped.
    struct HangingRuntime {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ToolRuntime for HangingRuntime {
        async fn run(&self, _audio: Arc<ConditionedSignal>, _coordinator: &mut ExtractionCoordinator) -> AppResult<()> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> String {
            "hanging".to_string()
        }
    }

    pub(crate) fn tone_wav(seconds: f32, rate: u32) -> Vec<u8> {
        let n = (seconds * rate as f32) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                0.4 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 1320.0 * t).sin()
            })
            .collect();
        wav_bytes(&samples, rate, 1)
    }

    pub(crate) fn pipeline(runtime: Arc<dyn ToolRuntime>, with_emotion: bool) -> TriagePipeline {
        let config = AppConfig::default();
        let conditioner = SignalConditioner::new(config.audio.clone()).unwrap();
        let extractor = FeatureExtractor::new(config.features.clone());
        let emotion = with_emotion.then(|| {
            let columns = extractor.schema().names().to_vec();
            EmotionModel::from_artifact(stump_artifact(columns, 0, f64::MAX), extractor.schema()).unwrap()
        });
        TriagePipeline::new(
            conditioner,
            extractor,
            emotion,
            FixedTranscriber::ok("someone has been shot, he is not breathing"),
            runtime,
            2,
            config.audio.classifier_sample_rate,
        )
    }

    fn raw() -> RawAudio {
        RawAudio::new(tone_wav(1.0, 16000), "audio/wav", Some("call.wav".to_string()))
    }

    #[tokio::test]
    async fn test_run_produces_report() {
        let runtime = Arc::new(ScriptedRuntime {
            json: Some(SHOOTING_JSON.to_string()),
        });
        let report = pipeline(runtime, false).run(Uuid::new_v4(), raw(), 0.0).await.unwrap();
        assert_eq!(report.triage_data.event, Event::Shooting);
        assert_eq!(report.severity_score, 4.40);
        assert!(report.emotion.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("emotion").is_none());
        assert_eq!(json["triage_data"]["weapon"], "firearm");
    }

    #[tokio::test]
    async fn test_run_attaches_emotion() {
        let runtime = Arc::new(ScriptedRuntime {
            json: Some(SHOOTING_JSON.to_string()),
        });
        let report = pipeline(runtime, true).run(Uuid::new_v4(), raw(), 0.0).await.unwrap();
        let emotion = report.emotion.unwrap();
        // Every value is <= f64::MAX, so the stump always takes the left leaf
        assert_eq!(emotion.predicted_label, "normal_calm");
        assert_eq!(emotion.score, 1.2);
        assert_eq!(report.severity_score, 4.40);
    }

    #[tokio::test]
    async fn test_run_without_commit_has_no_score() {
        let runtime = Arc::new(ScriptedRuntime { json: None });
        let err = pipeline(runtime, false).run(Uuid::new_v4(), raw(), 0.0).await.unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_run_rejects_undecodable_audio() {
        let runtime = Arc::new(ScriptedRuntime {
            json: Some(SHOOTING_JSON.to_string()),
        });
        let garbage = RawAudio::new(vec![1, 2, 3, 4], "audio/mpeg", None);
        let err = pipeline(runtime, false).run(Uuid::new_v4(), garbage, 0.0).await.unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
    }

    #[tokio::test]
    async fn test_dropped_request_aborts_branches() {
        let dropped = Arc::new(AtomicBool::new(false));
        let runtime = Arc::new(HangingRuntime {
            dropped: Arc::clone(&dropped),
        });
        let pipeline = pipeline(runtime, false);

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), pipeline.run(Uuid::new_v4(), raw(), 0.0)).await;
        assert!(result.is_err());

        for _ in 0..50 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_counts_held_slots() {
        let pipeline = pipeline(Arc::new(ScriptedRuntime { json: None }), false);
        assert_eq!(pipeline.slots(), 2);
        assert_eq!(pipeline.in_flight(), 0);

        let permit = Arc::clone(&pipeline.permits).acquire_owned().await.unwrap();
        assert_eq!(pipeline.in_flight(), 1);
        drop(permit);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_classify_path() {
        let pipeline = pipeline(Arc::new(ScriptedRuntime { json: None }), true);
        let report = pipeline.classify(raw()).await.unwrap();
        assert_eq!(report.predicted_label, "normal_calm");
        assert_eq!(report.class_probabilities.len(), 2);
        assert!((report.class_probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_classify_without_model() {
        let pipeline = pipeline(Arc::new(ScriptedRuntime { json: None }), false);
        assert!(matches!(pipeline.classify(raw()).await, Err(AppError::ModelLoad(_))));
    }
}
