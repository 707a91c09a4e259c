//! Stem separation job pipeline
//!
//! One job turns an uploaded audio file into a zip of separated stems:
//!
//! ```text
//! validate -> check storage -> save upload -> trim -> separate -> zip -> cleanup
//! ```
//!
//! Every file the job creates is registered with [`JobArtifacts`] before it
//! exists, and removed when the guard drops. Nothing outlives the job whether
//! it succeeds, fails, times out or is cancelled.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, ZipWriter};

use crate::error::{ApiError, ApiResult};
use crate::storage::remove_path_logged;
use crate::tools::ToolError;
use crate::AppState;

/// Extensions accepted for upload (compared case-insensitively)
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "flac", "ogg"];

/// Check a client-supplied filename against the allow-list
///
/// Returns the canonical lowercase extension. The rest of the name is never
/// used on disk.
pub fn validate_audio_filename(filename: &str) -> ApiResult<&'static str> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty());

    let Some(extension) = extension else {
        return Err(ApiError::UnsupportedFormat(format!(
            "File has no extension. Allowed: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    };

    ALLOWED_EXTENSIONS
        .iter()
        .find(|allowed| allowed.eq_ignore_ascii_case(extension))
        .copied()
        .ok_or_else(|| {
            ApiError::UnsupportedFormat(format!(
                "Unsupported file type. Allowed: {}",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })
}

/// Paths owned by one job, removed on drop
#[derive(Debug, Default)]
pub struct JobArtifacts {
    paths: Vec<PathBuf>,
}

impl JobArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `path`; it need not exist yet
    pub fn register(&mut self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        self.paths.push(path.clone());
        path
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for JobArtifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            remove_path_logged(&path);
        }
    }
}

/// Result of a successful job
#[derive(Debug)]
pub struct JobOutput {
    pub job_id: Uuid,
    /// Zip archive of the stem files
    pub archive: Vec<u8>,
    pub stem_count: usize,
}

/// Run the full pipeline for one upload
///
/// The caller must already hold a concurrency slot.
pub async fn run_separation(
    state: &AppState,
    filename: &str,
    payload: &[u8],
) -> ApiResult<JobOutput> {
    let extension = validate_audio_filename(filename)?;

    let storage = Arc::clone(&state.storage);
    let size_bytes = payload.len() as u64;
    let reservation = tokio::task::spawn_blocking(move || storage.reserve_upload(size_bytes))
        .await
        .map_err(|e| ApiError::Internal(format!("Storage check task failed: {e}")))??;

    let job_id = Uuid::new_v4();
    let started = Instant::now();
    let mut artifacts = JobArtifacts::new();
    info!(job_id = %job_id, size_bytes, extension, "Separation job started");

    let upload_path = artifacts.register(state.storage.upload_path(job_id, extension));
    state.storage.save_upload(job_id, extension, payload).await?;
    drop(reservation);

    let trimmed_path = artifacts.register(state.storage.trimmed_path(job_id, extension));
    state
        .tools
        .trim(&upload_path, &trimmed_path, state.limits.max_duration())
        .await?;
    debug!(job_id = %job_id, "Input trimmed");

    let output_dir = artifacts.register(state.storage.job_output_dir(job_id));
    tokio::fs::create_dir_all(&output_dir).await?;
    let stem_dir = state.tools.separate(&trimmed_path, &output_dir).await?;
    debug!(job_id = %job_id, "Stems separated");

    let (archive, stem_count) = tokio::task::spawn_blocking(move || zip_directory(&stem_dir))
        .await
        .map_err(|e| ApiError::Internal(format!("Archive task failed: {e}")))??;

    drop(artifacts);

    info!(
        job_id = %job_id,
        stems = stem_count,
        archive_bytes = archive.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Separation job finished"
    );

    Ok(JobOutput {
        job_id,
        archive,
        stem_count,
    })
}

/// Zip every file under `dir` into memory, with paths relative to `dir`
///
/// Entries are sorted so the archive layout is stable. An empty folder means
/// the separator produced nothing.
pub fn zip_directory(dir: &Path) -> ApiResult<(Vec<u8>, usize)> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(ApiError::Tool(ToolError::MissingOutput {
            tool: "spleeter",
            path: dir.to_path_buf(),
        }));
    }

    let archive_err =
        |e: zip::result::ZipError| ApiError::Internal(format!("Failed to build archive: {e}"));

    let mut buffer = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut buffer);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for file in &files {
        let name = file
            .strip_prefix(dir)
            .map_err(|e| ApiError::Internal(format!("Stem outside output folder: {e}")))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let contents = std::fs::read(file)?;
        zip.start_file(name, options).map_err(archive_err)?;
        zip.write_all(&contents)?;
    }

    zip.finish().map_err(archive_err)?;
    Ok((buffer.into_inner(), files.len()))
}
