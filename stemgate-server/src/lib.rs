//! stemgate-server library interface
//!
//! Exposes the admission layer, the job pipeline and the router so
//! integration tests can drive the service without binding a port.

pub mod api;
pub mod error;
pub mod guard;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod sweeper;
pub mod tools;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use stemgate_common::ResourceLimits;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::guard::{HostSampler, ResourceGuard};
use crate::ledger::TrafficLedger;
use crate::metrics::MetricsRecorder;
use crate::storage::StorageAccountant;
use crate::tools::AudioTools;

/// Allowance on top of `max_file_mb` for multipart framing
pub const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Compile-time stamps written by `build.rs`
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub timestamp: &'static str,
    pub profile: &'static str,
    pub target: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        timestamp: env!("BUILD_TIMESTAMP"),
        profile: env!("BUILD_PROFILE"),
        target: env!("BUILD_TARGET"),
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub limits: Arc<ResourceLimits>,
    pub guard: ResourceGuard,
    pub ledger: Arc<TrafficLedger>,
    pub storage: Arc<StorageAccountant>,
    pub metrics: Arc<MetricsRecorder>,
    pub tools: Arc<dyn AudioTools>,
    /// Separation model reported to clients
    pub separator_model: String,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        limits: Arc<ResourceLimits>,
        sampler: Arc<dyn HostSampler>,
        ledger: Arc<TrafficLedger>,
        storage: Arc<StorageAccountant>,
        metrics: Arc<MetricsRecorder>,
        tools: Arc<dyn AudioTools>,
        separator_model: impl Into<String>,
    ) -> Self {
        Self {
            guard: ResourceGuard::new(Arc::clone(&limits), sampler),
            limits,
            ledger,
            storage,
            metrics,
            tools,
            separator_model: separator_model.into(),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
///
/// Job routes sit behind the resource protection middleware and the upload
/// body limit; health, info and admin routes do not.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;
    use axum::routing::post;

    let body_limit = state
        .limits
        .max_file_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let jobs = Router::new()
        .route("/separate", post(api::separate_audio))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::resource_protection,
        ))
        .layer(DefaultBodyLimit::max(body_limit));

    let public = Router::new()
        .merge(api::health_routes())
        .merge(api::admin_routes());

    Router::new()
        .merge(jobs)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
