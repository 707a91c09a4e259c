//! Storage accounting for the managed upload and output directories
//!
//! Uploads are always written under a server-generated name
//! (`<job uuid>.<extension>`); the client-supplied filename only contributes
//! its validated extension.
//!
//! Admission against the storage ceiling is a reservation: bytes admitted by
//! [`StorageAccountant::reserve_upload`] count toward the ceiling until the
//! returned [`UploadReservation`] drops, by which time the upload is on disk.
//! Concurrent jobs therefore cannot both pass the check on the same free space.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Upload refused by the storage ceilings
#[derive(Debug, Error, PartialEq)]
pub enum StorageError {
    #[error("Uploaded file is empty")]
    EmptyPayload,

    #[error("File too large: {size_mb:.1} MB (max {limit_mb} MB)")]
    FileTooLarge { size_mb: f64, limit_mb: u64 },

    #[error("Storage full: {used_mb:.1} MB used, {incoming_mb:.1} MB incoming (limit {limit_mb} MB)")]
    StorageFull {
        used_mb: f64,
        incoming_mb: f64,
        limit_mb: u64,
    },
}

/// Bytes admitted but not yet written; released on drop
#[derive(Debug)]
pub struct UploadReservation {
    reserved: Arc<Mutex<u64>>,
    bytes: u64,
}

impl Drop for UploadReservation {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        *reserved = reserved.saturating_sub(self.bytes);
    }
}

/// Disk usage bookkeeping and path naming for job artifacts
#[derive(Debug, Clone)]
pub struct StorageAccountant {
    upload_dir: PathBuf,
    output_dir: PathBuf,
    max_file_mb: u64,
    max_storage_mb: u64,
    reserved: Arc<Mutex<u64>>,
}

impl StorageAccountant {
    pub fn new(
        upload_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        max_file_mb: u64,
        max_storage_mb: u64,
    ) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
            max_file_mb,
            max_storage_mb,
            reserved: Arc::new(Mutex::new(0)),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directories whose contents count toward the storage ceiling
    pub fn managed_dirs(&self) -> [&Path; 2] {
        [&self.upload_dir, &self.output_dir]
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    /// Total size of every file under the managed directories
    ///
    /// Entries that vanish or cannot be read mid-walk are skipped; the sweeper
    /// and finishing jobs delete files concurrently.
    pub fn current_usage_bytes(&self) -> u64 {
        self.managed_dirs()
            .iter()
            .filter(|dir| dir.exists())
            .flat_map(|dir| WalkDir::new(dir).follow_links(false).into_iter())
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    pub fn current_usage_mb(&self) -> f64 {
        self.current_usage_bytes() as f64 / BYTES_PER_MB
    }

    /// Bytes currently held by outstanding reservations
    pub fn reserved_bytes(&self) -> u64 {
        *self.lock_reserved()
    }

    /// Check an incoming payload against the per-file and total ceilings and
    /// hold its size against the total until the reservation drops
    ///
    /// Walks the managed directories; call from a blocking context.
    pub fn reserve_upload(&self, size_bytes: u64) -> Result<UploadReservation, StorageError> {
        if size_bytes == 0 {
            return Err(StorageError::EmptyPayload);
        }

        let size_mb = size_bytes as f64 / BYTES_PER_MB;
        if size_mb > self.max_file_mb as f64 {
            return Err(StorageError::FileTooLarge {
                size_mb,
                limit_mb: self.max_file_mb,
            });
        }

        // Held across the walk so two checks never see the same free space
        let mut reserved = self.lock_reserved();
        let used_mb = self.current_usage_bytes().saturating_add(*reserved) as f64 / BYTES_PER_MB;
        if used_mb + size_mb > self.max_storage_mb as f64 {
            return Err(StorageError::StorageFull {
                used_mb,
                incoming_mb: size_mb,
                limit_mb: self.max_storage_mb,
            });
        }

        *reserved = reserved.saturating_add(size_bytes);
        Ok(UploadReservation {
            reserved: Arc::clone(&self.reserved),
            bytes: size_bytes,
        })
    }

    fn lock_reserved(&self) -> MutexGuard<'_, u64> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the whole payload to `uploads/<job_id>.<extension>`
    ///
    /// The data lands in a temp file first and is renamed into place, so the
    /// final path never holds a partial upload.
    pub async fn save_upload(
        &self,
        job_id: Uuid,
        extension: &str,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.upload_path(job_id, extension);
        let partial = self.upload_dir.join(format!("{job_id}.{extension}.part"));

        if let Err(e) = tokio::fs::write(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &path).await?;

        debug!(
            job_id = %job_id,
            size_bytes = bytes.len(),
            path = %path.display(),
            "Upload persisted"
        );
        Ok(path)
    }

    /// Final location of a job's upload
    pub fn upload_path(&self, job_id: Uuid, extension: &str) -> PathBuf {
        self.upload_dir.join(format!("{job_id}.{extension}"))
    }

    /// Destination of the duration-limited copy of an upload
    pub fn trimmed_path(&self, job_id: Uuid, extension: &str) -> PathBuf {
        self.upload_dir.join(format!("{job_id}_trimmed.{extension}"))
    }

    /// Per-job folder handed to the separator
    pub fn job_output_dir(&self, job_id: Uuid) -> PathBuf {
        self.output_dir.join(job_id.to_string())
    }
}

/// Remove a file or directory tree, ignoring "already gone"
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// [`remove_path`] that logs instead of failing
pub fn remove_path_logged(path: &Path) {
    if let Err(e) = remove_path(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove job artifact");
    }
}
