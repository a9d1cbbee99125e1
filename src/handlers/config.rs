use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration; the agent API key is never echoed back.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "models": {
            "whisper_model": config.models.whisper_model,
            "whisper_language": config.models.whisper_language,
            "emotion_model_path": config.models.emotion_model_path,
            "llm_model": config.models.llm_model
        },
        "audio": config.audio,
        "features": config.features,
        "severity": config.severity,
        "agent": {
            "api_base": config.agent.api_base,
            "api_key_configured": !config.agent.api_key.is_empty(),
            "max_turns": config.agent.max_turns,
            "timeout_secs": config.agent.timeout_secs
        },
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial update of the runtime-tunable sections.
///
/// `performance.max_concurrent_requests` is stored but the pipeline's request
/// slots are sized at startup, so a new limit applies after a restart.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = body.into_inner().to_string();

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::Validation)?;

    tracing::info!("Configuration updated at runtime");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{pipeline, ScriptedRuntime};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.agent.api_key = "secret".to_string();
        AppState::new(config, pipeline(Arc::new(ScriptedRuntime { json: None }), false))
    }

    #[actix_web::test]
    async fn test_get_config_hides_key() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["agent"]["api_key_configured"], true);
        assert!(!body.to_string().contains("secret"));
        assert_eq!(body["config"]["audio"]["target_sample_rate"], 16000);
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"severity": {"emotion_weight": 0.3}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().severity.emotion_weight, 0.3);

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"severity": {"emotion_weight": 3.0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().severity.emotion_weight, 0.3);
    }
}
