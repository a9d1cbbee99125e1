//! # Error Handling
//!
//! Defines the error taxonomy shared by every stage of the triage pipeline and how
//! each kind is turned into an HTTP response.
//!
//! ## Error Kinds:
//! - **Input**: the caller sent something we cannot process (bad mime type, short audio)
//! - **Configuration**: DSP parameters that cannot form a valid filter or pipeline
//! - **Schema**: feature vector does not line up with the trained model's columns
//! - **ModelLoad**: a model artifact could not be loaded at startup
//! - **Extraction**: the transcript/field protocol never produced a valid commit
//! - **Validation**: a categorical field is outside its closed vocabulary
//! - **ExternalService**: transcription engine or language model failed
//! - **Internal**: plumbing failures (task join errors, I/O)
//!
//! ## Why one enum:
//! Every stage returns `AppResult<T>`, so `?` carries the kind all the way up to the
//! handler without any stage having to know about HTTP.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Every failure the service can surface, tagged with its kind.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::Input("Audio too short".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Invalid upload: wrong content type, undecodable or too-short audio
    Input(String),

    /// Invalid DSP or service parameters (e.g. band-pass edges out of order)
    Configuration(String),

    /// Feature names/order disagree with the model artifact
    Schema(String),

    /// Model artifact or weights could not be loaded
    ModelLoad(String),

    /// Missing or malformed structured commit from the extraction protocol
    Extraction(String),

    /// Categorical value outside its closed vocabulary
    Validation(String),

    /// Transcription engine or language-model call failed
    ExternalService(String),

    /// Anything else (join errors, I/O on the server side)
    Internal(String),
}

impl AppError {
    /// Machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Input(_) => "input_error",
            AppError::Configuration(_) => "configuration_error",
            AppError::Schema(_) => "schema_error",
            AppError::ModelLoad(_) => "model_load_error",
            AppError::Extraction(_) => "extraction_error",
            AppError::Validation(_) => "validation_error",
            AppError::ExternalService(_) => "external_service_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// The human-readable cause without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::Input(msg)
            | AppError::Configuration(msg)
            | AppError::Schema(msg)
            | AppError::ModelLoad(msg)
            | AppError::Extraction(msg)
            | AppError::Validation(msg)
            | AppError::ExternalService(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Input(msg) => write!(f, "Input error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Schema(msg) => write!(f, "Schema error: {}", msg),
            AppError::ModelLoad(msg) => write!(f, "Model load error: {}", msg),
            AppError::Extraction(msg) => write!(f, "Extraction error: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::ExternalService(msg) => write!(f, "External service error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts pipeline errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Input/Validation → 400 (Bad Request)
/// - Extraction → 422 (Unprocessable Entity), the call was understood but no triage record came out
/// - ExternalService → 502 (Bad Gateway)
/// - Configuration/Schema/ModelLoad/Internal → 500
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Unknown event 'parade'",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Input(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_)
            | AppError::Schema(_)
            | AppError::ModelLoad(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),                          // Machine-readable error type
                "message": self.message(),                    // Human-readable cause
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Configuration loading failures surface as configuration errors.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// A blocking or spawned pipeline task panicked or was cancelled.
impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Pipeline task failed: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Input("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Extraction("x".into()).status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(AppError::ExternalService("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::Schema("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_kind_and_message() {
        let err = AppError::Configuration("low >= high".into());
        assert_eq!(err.kind(), "configuration_error");
        assert_eq!(err.message(), "low >= high");
        assert_eq!(err.to_string(), "Configuration error: low >= high");
    }
}
