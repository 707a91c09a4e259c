//! Operator endpoints: resource metrics and traffic budget
//!
//! Unauthenticated. Deployments that expose the service publicly must put
//! these paths behind their own access control.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use stemgate_common::ResourceLimits;

use super::run_blocking;
use crate::error::ApiResult;
use crate::ledger::LedgerSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CurrentUsage {
    pub ram_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub active_slots: usize,
    pub max_slots: usize,
    pub storage_mb: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub current: CurrentUsage,
    pub history: MetricsSnapshot,
    pub limits: ResourceLimits,
}

/// GET /admin/metrics
pub async fn get_metrics(State(state): State<AppState>) -> ApiResult<Json<MetricsResponse>> {
    let host = state.guard.sample_host();

    let storage = Arc::clone(&state.storage);
    let storage_mb = run_blocking("Storage walk", move || storage.current_usage_mb()).await?;

    Ok(Json(MetricsResponse {
        current: CurrentUsage {
            ram_mb: host.map(|h| h.ram_used_mb.round()),
            cpu_percent: host.map(|h| (h.cpu_percent * 10.0).round() / 10.0),
            active_slots: state.guard.active_slots(),
            max_slots: state.guard.max_slots(),
            storage_mb: (storage_mb * 100.0).round() / 100.0,
        },
        history: state.metrics.snapshot(),
        limits: (*state.limits).clone(),
    }))
}

/// GET /admin/traffic
pub async fn get_traffic(State(state): State<AppState>) -> ApiResult<Json<LedgerSnapshot>> {
    let ledger = Arc::clone(&state.ledger);
    Ok(Json(run_blocking("Traffic snapshot", move || ledger.snapshot()).await?))
}

/// Build admin routes
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/traffic", get(get_traffic))
}
