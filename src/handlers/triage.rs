//! # Triage Handler
//!
//! `POST /agent/generate_json/`: multipart upload with an `audio` field.
//!
//! ## Response:
//! ```json
//! {
//!   "transcript": "Someone's been shot outside the station...",
//!   "triage_data": {
//!     "event": "shooting",
//!     "victims": 1,
//!     "injuries": "unresponsive",
//!     "weapon": "firearm",
//!     "ongoing_threat": "shooter fled on foot"
//!   },
//!   "severity_score": 4.4,
//!   "emotion": { "predicted_label": "strong_fearful", "score": 4.8 }
//! }
//! ```
//! `emotion` is present only when an emotion model is loaded.

use actix_multipart::Multipart;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use uuid::Uuid;

use super::upload::{is_audio, read_audio_field, UploadPolicy};
use crate::error::AppError;
use crate::middleware::logging::RequestId;
use crate::state::AppState;

/// Any `audio/*` type, or a WAV container sent under another type.
const CALL_UPLOAD: UploadPolicy = UploadPolicy {
    field_name: "audio",
    accept: is_audio,
    sniff_wav: true,
    rejection: |received| format!("Invalid file. Expected audio file, received {} file.", received),
};

pub async fn generate_json(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0)
        .unwrap_or_else(Uuid::new_v4);

    let raw = read_audio_field(payload, &CALL_UPLOAD, config.performance.max_upload_bytes).await?;
    tracing::info!(
        "Request {}: triaging '{}' ({} bytes)",
        request_id,
        raw.file_name.as_deref().unwrap_or("unnamed"),
        raw.bytes.len()
    );

    let _active = state.begin_request();
    let report = state
        .pipeline
        .run(request_id, raw, config.severity.emotion_weight)
        .await?;

    Ok(HttpResponse::Ok().json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers::upload::tests::{multipart_body, multipart_content_type};
    use crate::pipeline::tests::{pipeline, tone_wav, ScriptedRuntime};
    use crate::triage::coordinator::tests::SHOOTING_JSON;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    async fn call(json: Option<&str>, field: &str, content_type: &str, data: &[u8]) -> (StatusCode, serde_json::Value) {
        let runtime = Arc::new(ScriptedRuntime {
            json: json.map(|s| s.to_string()),
        });
        let state = AppState::new(AppConfig::default(), pipeline(runtime, false));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/agent/generate_json/", web::post().to(generate_json)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/agent/generate_json/")
            .insert_header(("content-type", multipart_content_type()))
            .set_payload(multipart_body(field, "call.wav", content_type, data))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status();
        let body: serde_json::Value = test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn test_generate_json() {
        let (status, body) = call(Some(SHOOTING_JSON), "audio", "audio/wav", &tone_wav(1.0, 16000)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["triage_data"]["event"], "shooting");
        assert_eq!(body["triage_data"]["victims"], 1);
        assert_eq!(body["severity_score"], 4.4);
        assert!(body["transcript"].as_str().unwrap().contains("shot"));
    }

    #[actix_web::test]
    async fn test_rejects_non_audio() {
        let (status, body) = call(Some(SHOOTING_JSON), "audio", "text/plain", b"hello").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "input_error");
    }

    #[actix_web::test]
    async fn test_accepts_wav_container_with_generic_type() {
        let (status, body) = call(
            Some(SHOOTING_JSON),
            "audio",
            "application/octet-stream",
            &tone_wav(1.0, 16000),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["triage_data"]["event"], "shooting");

        let (status, body) = call(Some(SHOOTING_JSON), "audio", "application/octet-stream", b"not a wav file").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"]["message"],
            "Invalid file. Expected audio file, received application/octet-stream file."
        );
    }

    #[actix_web::test]
    async fn test_missing_field() {
        let (status, _) = call(Some(SHOOTING_JSON), "file", "audio/wav", &tone_wav(0.5, 16000)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_no_commit_is_unprocessable() {
        let (status, body) = call(None, "audio", "audio/wav", &tone_wav(1.0, 16000)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["type"], "extraction_error");
    }

    #[actix_web::test]
    async fn test_out_of_vocabulary_is_bad_request() {
        let json = r#"{"event": "shooting", "victims": 1, "injuries": "gunshot", "weapon": "firearm", "ongoing_threat": "not ongoing"}"#;
        let (status, body) = call(Some(json), "audio", "audio/wav", &tone_wav(1.0, 16000)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "validation_error");
    }
}
