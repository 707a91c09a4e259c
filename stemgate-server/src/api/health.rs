//! Service info and health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::ALLOWED_EXTENSIONS;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub resources: HealthResources,
}

#[derive(Debug, Serialize)]
pub struct HealthResources {
    pub active_slots: usize,
    pub max_slots: usize,
    /// Null when the host cannot be sampled
    pub ram_mb: Option<f64>,
}

/// GET /health
///
/// Never passes through admission control.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = Utc::now();
    let uptime = (now - state.startup_time).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: now,
        module: "stemgate-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        resources: HealthResources {
            active_slots: state.guard.active_slots(),
            max_slots: state.guard.max_slots(),
            ram_mb: state.guard.sample_host().map(|h| h.ram_used_mb.round()),
        },
    })
}

/// Service description returned at the root
#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub status: String,
    pub version: String,
    pub model: String,
    pub limits: UserLimits,
}

/// The subset of limits a client needs to build a valid request
#[derive(Debug, Serialize)]
pub struct UserLimits {
    pub max_file_mb: u64,
    pub max_duration_sec: u64,
    pub allowed_formats: Vec<String>,
}

/// GET /
pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "stemgate".to_string(),
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.separator_model.clone(),
        limits: UserLimits {
            max_file_mb: state.limits.max_file_mb,
            max_duration_sec: state.limits.max_duration_sec,
            allowed_formats: ALLOWED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        },
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
}
