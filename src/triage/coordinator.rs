//! # Extraction Coordinator
//!
//! Request-scoped state machine behind the two tool contracts the language model
//! is allowed to call: fetch the transcript, then commit the structured fields.
//!
//! ## States:
//! ```text
//! Idle ──transcribe──▶ Transcribing ──text──▶ Extracting ──commit──▶ Committed
//!   │                       │                     │
//!   └───────────────────────┴─────── error ───────┴──────────────▶ Failed
//! ```
//! `Committed` and `Failed` are absorbing. A second commit is rejected and the
//! first committed value is kept.

use std::sync::Arc;

use uuid::Uuid;

use crate::audio::ConditionedSignal;
use crate::error::{AppError, AppResult};
use crate::transcription::Transcriber;
use crate::triage::fields::TriageFields;

/// Ask for the transcript of the request's audio.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio: Arc<ConditionedSignal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeResult {
    pub transcript: String,
    /// True when the transcript was produced by an earlier request on this coordinator
    pub cached: bool,
}

/// The model's single structured commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub transcript: String,
    pub json_object: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Accepted(TriageFields),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorState {
    Idle,
    Transcribing,
    Extracting { transcript: String },
    Committed { transcript: String, fields: TriageFields },
    Failed(AppError),
}

impl CoordinatorState {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Transcribing => "transcribing",
            CoordinatorState::Extracting { .. } => "extracting",
            CoordinatorState::Committed { .. } => "committed",
            CoordinatorState::Failed(_) => "failed",
        }
    }
}

/// Outcome of a completed protocol run.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub transcript: String,
    pub fields: TriageFields,
}

pub struct ExtractionCoordinator {
    request_id: Uuid,
    transcriber: Arc<dyn Transcriber>,
    state: CoordinatorState,
}

impl ExtractionCoordinator {
    pub fn new(request_id: Uuid, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            request_id,
            transcriber,
            state: CoordinatorState::Idle,
        }
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CoordinatorState::Committed { .. } | CoordinatorState::Failed(_))
    }

    fn transition(&mut self, next: CoordinatorState) {
        tracing::info!(
            "Request {}: coordinator {} -> {}",
            self.request_id,
            self.state.name(),
            next.name()
        );
        self.state = next;
    }

    /// Handle `get_transcription`. The transcriber runs at most once per coordinator.
    pub async fn transcribe(&mut self, request: TranscribeRequest) -> AppResult<TranscribeResult> {
        match &self.state {
            CoordinatorState::Idle => {}
            CoordinatorState::Extracting { transcript } | CoordinatorState::Committed { transcript, .. } => {
                return Ok(TranscribeResult {
                    transcript: transcript.clone(),
                    cached: true,
                });
            }
            CoordinatorState::Failed(err) => return Err(err.clone()),
            CoordinatorState::Transcribing => {
                return Err(AppError::Internal("Transcription already in progress".to_string()));
            }
        }

        self.transition(CoordinatorState::Transcribing);
        match self.transcriber.transcribe(&request.audio).await {
            Ok(transcript) => {
                tracing::debug!("Request {}: transcript has {} chars", self.request_id, transcript.len());
                self.transition(CoordinatorState::Extracting {
                    transcript: transcript.clone(),
                });
                Ok(TranscribeResult {
                    transcript,
                    cached: false,
                })
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Handle `extract_info`. Only the first valid commit is kept.
    pub fn commit(&mut self, request: CommitRequest) -> CommitResult {
        let cached = match &self.state {
            CoordinatorState::Extracting { transcript } => Some(transcript.clone()),
            CoordinatorState::Committed { .. } => {
                tracing::warn!(
                    "Request {}: rejected commit after the triage record was already committed",
                    self.request_id
                );
                return CommitResult::Rejected("A triage record has already been committed".to_string());
            }
            CoordinatorState::Failed(err) => {
                return CommitResult::Rejected(format!("Extraction already failed: {}", err));
            }
            CoordinatorState::Idle | CoordinatorState::Transcribing => None,
        };
        let Some(cached) = cached else {
            let err = AppError::Extraction("Commit arrived before transcription".to_string());
            let message = err.to_string();
            self.fail(err);
            return CommitResult::Rejected(message);
        };

        match TriageFields::from_json(&request.json_object) {
            Ok(fields) => {
                let transcript = if request.transcript.trim().is_empty() {
                    cached
                } else {
                    request.transcript
                };
                self.transition(CoordinatorState::Committed {
                    transcript,
                    fields: fields.clone(),
                });
                CommitResult::Accepted(fields)
            }
            Err(err) => {
                let message = err.to_string();
                self.fail(err);
                CommitResult::Rejected(message)
            }
        }
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self, err: AppError) {
        if self.is_terminal() {
            return;
        }
        tracing::debug!("Request {}: extraction failed: {}", self.request_id, err);
        self.transition(CoordinatorState::Failed(err));
    }

    /// Consume the coordinator; anything short of `Committed` is an error.
    pub fn finish(self) -> AppResult<Extraction> {
        match self.state {
            CoordinatorState::Committed { transcript, fields } => Ok(Extraction { transcript, fields }),
            CoordinatorState::Failed(err) => Err(err),
            other => Err(AppError::Extraction(format!(
                "No triage record was committed (coordinator stopped while {})",
                other.name()
            ))),
        }
    }
}
