//! Error types for stemgate-server
//!
//! Every failure a request can hit maps to one [`ApiError`] variant:
//! - capacity and traffic rejections are retryable 503s with a retry hint
//! - validation failures are non-retryable 4xx
//! - tool failures are 5xx, logged with the tool's diagnostics
//!
//! Response bodies never contain filesystem paths or tool output.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::guard::CapacityRejection;
use crate::storage::StorageError;
use crate::tools::ToolError;

/// Seconds clients are told to wait after a capacity rejection
pub const CAPACITY_RETRY_AFTER_SECS: u64 = 60;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Host load, concurrency or storage ceiling reached (503)
    #[error("Service at capacity: {message}")]
    Capacity {
        reason: &'static str,
        message: String,
    },

    /// Monthly traffic budget spent (503)
    #[error("Monthly traffic limit reached, resets at {resets_at}")]
    TrafficLimit {
        resets_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// File extension outside the allow-list (400)
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Zero-length upload (400)
    #[error("Uploaded file is empty")]
    EmptyFile,

    /// Upload above the per-file ceiling (413)
    #[error("File too large: {0}")]
    FileTooLarge(String),

    /// Malformed request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// External tool failed, timed out or produced nothing (500/504)
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CapacityRejection> for ApiError {
    fn from(rejection: CapacityRejection) -> Self {
        ApiError::Capacity {
            reason: rejection.reason(),
            message: rejection.to_string(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::EmptyPayload => ApiError::EmptyFile,
            StorageError::FileTooLarge { .. } => ApiError::FileTooLarge(err.to_string()),
            StorageError::StorageFull { .. } => ApiError::Capacity {
                reason: "storage_limit",
                message: err.to_string(),
            },
        }
    }
}

impl ApiError {
    /// Whether retrying the same request later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Capacity { .. } | ApiError::TrafficLimit { .. })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Capacity { .. } | ApiError::TrafficLimit { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::UnsupportedFormat(_) | ApiError::EmptyFile | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Tool(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Tool(_) | ApiError::Internal(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn tool_activity(tool: &str) -> &'static str {
    match tool {
        "ffmpeg" => "Audio trimming",
        "spleeter" => "Stem separation",
        _ => "Audio processing",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut retry_after = None;

        let body: Value = match &self {
            ApiError::Capacity { reason, message } => {
                warn!(reason, "Request rejected: {}", message);
                retry_after = Some(CAPACITY_RETRY_AFTER_SECS);
                json!({
                    "error": {
                        "code": "CAPACITY_EXCEEDED",
                        "message": "Server temporarily unavailable",
                        "reason": reason,
                        "detail": message,
                        "retry_after": CAPACITY_RETRY_AFTER_SECS,
                    }
                })
            }
            ApiError::TrafficLimit {
                resets_at,
                retry_after_secs,
            } => {
                warn!(resets_at = %resets_at, "Request rejected: monthly traffic limit reached");
                retry_after = Some(*retry_after_secs);
                json!({
                    "error": {
                        "code": "TRAFFIC_LIMIT_REACHED",
                        "message": "Monthly traffic limit reached",
                        "reason": "traffic_limit",
                        "resets_at": resets_at.to_rfc3339(),
                        "retry_after": retry_after_secs,
                    }
                })
            }
            ApiError::UnsupportedFormat(msg) => json!({
                "error": { "code": "UNSUPPORTED_FORMAT", "message": msg }
            }),
            ApiError::EmptyFile => json!({
                "error": { "code": "EMPTY_FILE", "message": self.to_string() }
            }),
            ApiError::FileTooLarge(msg) => json!({
                "error": { "code": "FILE_TOO_LARGE", "message": msg }
            }),
            ApiError::BadRequest(msg) => json!({
                "error": { "code": "BAD_REQUEST", "message": msg }
            }),
            ApiError::Tool(err) => {
                error!(tool = err.tool(), error = %err, "External tool failed");
                let (code, message) = if err.is_timeout() {
                    ("TOOL_TIMEOUT", format!("{} timed out", tool_activity(err.tool())))
                } else {
                    ("TOOL_FAILED", format!("{} failed", tool_activity(err.tool())))
                };
                json!({ "error": { "code": code, "message": message } })
            }
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                json!({
                    "error": { "code": "INTERNAL_ERROR", "message": "Internal server error" }
                })
            }
            ApiError::Io(err) => {
                error!("IO error: {}", err);
                json!({
                    "error": { "code": "IO_ERROR", "message": "Internal server error" }
                })
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_maps_to_503_with_retry_after() {
        let err = ApiError::from(CapacityRejection::Concurrency { active: 2, max: 2 });
        assert!(err.is_retryable());

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }

    #[test]
    fn test_storage_errors_map_to_taxonomy() {
        assert!(matches!(
            ApiError::from(StorageError::EmptyPayload),
            ApiError::EmptyFile
        ));
        assert_eq!(
            ApiError::from(StorageError::FileTooLarge {
                size_mb: 60.0,
                limit_mb: 50
            })
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        let full = ApiError::from(StorageError::StorageFull {
            used_mb: 9000.0,
            incoming_mb: 10.0,
            limit_mb: 9000,
        });
        assert!(matches!(full, ApiError::Capacity { reason: "storage_limit", .. }));
    }

    #[test]
    fn test_tool_timeout_is_504_and_failure_is_500() {
        let timeout = ApiError::from(ToolError::TimedOut {
            tool: "spleeter",
            after: std::time::Duration::from_secs(120),
        });
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!timeout.is_retryable());

        let failed = ApiError::from(ToolError::Exited {
            tool: "ffmpeg",
            code: Some(1),
            stderr: "/srv/uploads/x.mp3: Invalid data".to_string(),
        });
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validation_errors_are_client_errors() {
        assert_eq!(
            ApiError::UnsupportedFormat("exe".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::EmptyFile.status(), StatusCode::BAD_REQUEST);
        assert!(!ApiError::EmptyFile.is_retryable());
    }
}
