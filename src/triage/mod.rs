//! # Triage Module
//!
//! Everything between the conditioned call audio and the severity score:
//! - **fields**: closed vocabularies and the committed triage record
//! - **coordinator**: the request-scoped transcribe-then-commit state machine
//! - **agent**: the language-model tool runtime that drives the coordinator
//! - **severity**: the deterministic score over the committed fields

pub mod agent;        // Chat-completions tool runtime
pub mod coordinator;  // Two-phase extraction protocol
pub mod fields;       // Closed-vocabulary triage record
pub mod severity;     // Score aggregation

pub use agent::{ChatToolRuntime, ToolRuntime};
pub use coordinator::{Extraction, ExtractionCoordinator};
pub use fields::TriageFields;
