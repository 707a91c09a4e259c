//! Stem separation endpoint
//!
//! `POST /separate` takes a multipart form with one `file` field and answers
//! with a zip of the separated stems.
//!
//! Admission runs in a fixed order before any payload is read:
//! 1. host load (protection middleware)
//! 2. concurrency slot, held until the response is built
//! 3. monthly traffic budget
//! 4. file size and storage ceiling (inside the job pipeline)

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::info;

use super::run_blocking;
use crate::error::{ApiError, ApiResult};
use crate::job;
use crate::AppState;

/// Multipart field carrying the audio file
pub const FILE_FIELD: &str = "file";

/// POST /separate
pub async fn separate_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let _permit = state.guard.try_acquire()?;

    let ledger = Arc::clone(&state.ledger);
    if let Some((resets_at, retry_after_secs)) =
        run_blocking("Traffic check", move || ledger.exhausted_until()).await?
    {
        return Err(ApiError::TrafficLimit {
            resets_at,
            retry_after_secs,
        });
    }

    let (filename, payload) = read_file_field(&mut multipart, state.limits.max_file_mb).await?;
    let output = job::run_separation(&state, &filename, &payload).await?;

    state.metrics.record_request();
    let ledger = Arc::clone(&state.ledger);
    let (upload_bytes, download_bytes) = (payload.len() as u64, output.archive.len() as u64);
    run_blocking("Traffic accounting", move || {
        ledger.add_traffic(upload_bytes, download_bytes)
    })
    .await?;

    info!(
        job_id = %output.job_id,
        upload_bytes = payload.len(),
        archive_bytes = output.archive.len(),
        "Stems delivered"
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"stems.zip\""),
        ],
        output.archive,
    )
        .into_response())
}

/// Pull the filename and contents of the `file` field, skipping other fields
async fn read_file_field(
    multipart: &mut Multipart,
    max_file_mb: u64,
) -> ApiResult<(String, Bytes)> {
    let to_api_error = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::FileTooLarge(format!("Upload exceeds {max_file_mb} MB"))
        } else {
            ApiError::BadRequest(e.body_text())
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(to_api_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_owned)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ApiError::BadRequest("No file selected".to_string()))?;
        let payload = field.bytes().await.map_err(to_api_error)?;
        return Ok((filename, payload));
    }

    Err(ApiError::BadRequest(format!("No '{FILE_FIELD}' part in request")))
}
