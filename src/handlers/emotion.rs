//! `POST /predict_audio/`: classifier-only path over an uploaded WAV (`file` field).

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};

use super::upload::{is_wav, read_audio_field, UploadPolicy};
use crate::error::AppError;
use crate::state::AppState;

/// Declared WAV content types only.
const CLIP_UPLOAD: UploadPolicy = UploadPolicy {
    field_name: "file",
    accept: is_wav,
    sniff_wav: false,
    rejection: |_| "Please upload a WAV file".to_string(),
};

/// Response: `{"predicted_label", "class_probabilities", "score"}`.
pub async fn predict_audio(state: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse, AppError> {
    if state.pipeline.emotion_model().is_none() {
        return Err(AppError::ModelLoad(
            "Emotion model is not loaded; predictions are unavailable".to_string(),
        ));
    }

    let max_bytes = state.get_config().performance.max_upload_bytes;
    let raw = read_audio_field(payload, &CLIP_UPLOAD, max_bytes).await?;

    let _active = state.begin_request();
    let report = state.pipeline.classify(raw).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers::upload::tests::{multipart_body, multipart_content_type};
    use crate::pipeline::tests::{pipeline, tone_wav, ScriptedRuntime};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    async fn call(with_model: bool, content_type: &str) -> (StatusCode, serde_json::Value) {
        let state = AppState::new(
            AppConfig::default(),
            pipeline(Arc::new(ScriptedRuntime { json: None }), with_model),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/predict_audio/", web::post().to(predict_audio)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict_audio/")
            .insert_header(("content-type", multipart_content_type()))
            .set_payload(multipart_body("file", "clip.wav", content_type, &tone_wav(1.0, 22050)))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status();
        (status, test::read_body_json(resp).await)
    }

    #[actix_web::test]
    async fn test_predict_audio() {
        let (status, body) = call(true, "audio/x-wav").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predicted_label"], "normal_calm");
        assert_eq!(body["class_probabilities"].as_array().unwrap().len(), 2);
        assert_eq!(body["score"], 1.2);
    }

    #[actix_web::test]
    async fn test_rejects_non_wav() {
        let (status, body) = call(true, "audio/mpeg").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "Please upload a WAV file");
    }

    #[actix_web::test]
    async fn test_without_model() {
        let (status, body) = call(false, "audio/wav").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "model_load_error");
    }
}
