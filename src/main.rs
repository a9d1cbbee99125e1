//! # Call Triage Backend - Main Application Entry Point
//!
//! HTTP service that turns a recorded emergency call into a triage record and a
//! severity score.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **audio**: decoding and the fixed signal-conditioning chain
//! - **features**: the 58-value acoustic feature vector
//! - **emotion**: pretrained emotion classifier and its severity contribution
//! - **transcription**: Whisper speech-to-text through Candle
//! - **triage**: closed-vocabulary fields, the extraction protocol, the
//!   language-model tool runtime and the severity score
//! - **pipeline**: per-request orchestration of all of the above
//! - **state / health / middleware / handlers**: the HTTP shell
//! - **error**: error taxonomy and HTTP error responses
//!
//! ## Startup:
//! Models are loaded before the server binds. A broken emotion artifact or a
//! Whisper checkpoint that cannot be fetched stops startup; a missing emotion
//! artifact only disables the emotion features.

mod audio;          // Signal conditioning (audio/ directory)
mod config;         // Configuration management (config.rs)
mod emotion;        // Emotion classification (emotion/ directory)
mod error;          // Error handling types (error.rs)
mod features;       // Feature extraction (features/ directory)
mod handlers;       // HTTP request handlers (handlers/ directory)
mod health;         // Health check endpoints (health.rs)
mod middleware;     // Custom middleware (middleware/ directory)
mod pipeline;       // Request orchestration (pipeline.rs)
mod state;          // Application state management (state.rs)
mod transcription;  // Speech-to-text (transcription/ directory)
mod triage;         // Triage record, protocol and scoring (triage/ directory)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audio::SignalConditioner;
use crate::emotion::EmotionModel;
use crate::features::FeatureExtractor;
use crate::pipeline::TriagePipeline;
use crate::transcription::{ModelSize, WhisperTranscriber};
use crate::triage::ChatToolRuntime;

/// Global shutdown signal set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Loads models** and builds the triage pipeline
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-triage-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let pipeline = build_pipeline(&config).await?;
    let app_state = AppState::new(config.clone(), pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    // Multipart bodies are capped per field; this bounds everything else
    let json_limit = 64 * 1024;

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().limit(json_limit))
            // Middleware executes in reverse order of registration for requests
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/agent/generate_json/", web::post().to(handlers::generate_json))
            .route("/predict_audio/", web::post().to(handlers::predict_audio))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Load every model and collaborator the pipeline needs.
///
/// ## Failure policy:
/// - Emotion artifact present but unreadable or with a different feature
///   schema: startup fails, the service never serves wrong predictions
/// - Emotion artifact absent: startup continues without emotion output
/// - Whisper checkpoint or agent settings unusable: startup fails
async fn build_pipeline(config: &AppConfig) -> Result<TriagePipeline> {
    let conditioner = SignalConditioner::new(config.audio.clone())?;
    let extractor = FeatureExtractor::new(config.features.clone());

    let emotion_path = Path::new(&config.models.emotion_model_path);
    let emotion = if emotion_path.exists() {
        Some(EmotionModel::load(emotion_path, extractor.schema())?)
    } else {
        warn!(
            "No emotion model at {}; /predict_audio/ is disabled and triage reports carry no emotion",
            emotion_path.display()
        );
        None
    };

    let size: ModelSize = config.models.whisper_model.parse()?;
    let transcriber = WhisperTranscriber::load(size, &config.models.whisper_language).await?;

    let runtime = ChatToolRuntime::new(&config.agent, &config.models.llm_model)?;

    Ok(TriagePipeline::new(
        conditioner,
        extractor,
        emotion,
        Arc::new(transcriber),
        Arc::new(runtime),
        config.performance.max_concurrent_requests,
        config.audio.classifier_sample_rate,
    ))
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged
/// - If not set, defaults to "call_triage_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_triage_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// If a handler cannot be installed the server keeps running; it can still be
/// stopped by the process manager.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
