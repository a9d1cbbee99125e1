use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "call-triage-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_requests": metrics.active_requests
        },
        "memory": get_memory_info(),
        "models": get_model_status(&state, &config),
        "system": get_system_status(state.pipeline.slots(), &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_requests": metrics.active_requests,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_requests": config.performance.max_concurrent_requests,
            "max_upload_bytes": config.performance.max_upload_bytes,
            "pipeline_slots": state.pipeline.slots(),
            "pipeline_in_flight": state.pipeline.in_flight()
        }
    }))
}

fn get_model_status(state: &AppState, config: &crate::config::AppConfig) -> serde_json::Value {
    let emotion = match state.pipeline.emotion_model() {
        Some(model) => json!({
            "path": config.models.emotion_model_path,
            "status": "loaded",
            "available": true,
            "format_version": model.format_version(),
            "kind": model.kind(),
            "classes": model.labels()
        }),
        None => json!({
            "path": config.models.emotion_model_path,
            "status": "not_loaded",
            "available": false
        }),
    };

    json!({
        "whisper": {
            "model": config.models.whisper_model,
            "engine": state.pipeline.transcriber_name(),
            "status": "loaded",
            "available": true
        },
        "emotion": emotion,
        "llm": {
            "model": config.models.llm_model,
            "runtime": state.pipeline.runtime_name(),
            "api_base": config.agent.api_base,
            "api_key_configured": !config.agent.api_key.is_empty()
        }
    })
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    let _ = pid;
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Load is measured against the slots the pipeline was built with, not the
/// configured limit, which only takes effect on restart.
fn get_system_status(slots: usize, metrics: &crate::state::AppMetrics) -> serde_json::Value {
    let usage = if slots > 0 {
        metrics.active_requests as f64 / slots as f64
    } else {
        0.0
    };

    // Requests beyond the limit queue on the pipeline semaphore
    let status = if usage >= 1.0 {
        "queueing"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "request_usage_percent": (usage * 100.0).round(),
        "pipeline_slots": slots,
        "current_requests": metrics.active_requests,
        "load_warnings": if usage >= 1.0 {
            vec!["Pipeline is saturated - calls are waiting for a free slot"]
        } else {
            vec![]
        }
    })
}
