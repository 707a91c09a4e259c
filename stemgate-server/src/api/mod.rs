//! HTTP API handlers for stemgate-server

pub mod admin;
pub mod health;
pub mod protection;
pub mod separate;

pub use admin::admin_routes;
pub use health::health_routes;
pub use protection::resource_protection;
pub use separate::separate_audio;

use crate::error::{ApiError, ApiResult};

/// Run synchronous file-touching work (ledger, storage walks) off the async workers
pub(crate) async fn run_blocking<F, T>(what: &'static str, work: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("{what} task failed: {e}")))
}
