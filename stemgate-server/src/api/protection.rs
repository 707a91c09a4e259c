//! Resource protection middleware
//!
//! Applied to job routes only. Health and admin routes stay reachable while
//! the host is overloaded so operators can see why jobs are refused.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::ApiResult;
use crate::AppState;

/// Refuse the request with 503 when host RAM or CPU is above its ceiling
///
/// Concurrency slots are not taken here; the handler acquires one and holds
/// it for the life of the job.
pub async fn resource_protection(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    state.guard.check_resources()?;
    Ok(next.run(request).await)
}
