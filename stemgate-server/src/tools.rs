//! External audio tools
//!
//! Trimming and stem separation are delegated to command-line programs
//! (`ffmpeg` and `spleeter`). Each invocation runs under a hard timeout; a child
//! still running when its timeout expires is killed.
//!
//! The [`AudioTools`] trait is the seam between the job pipeline and the
//! processes, so the pipeline can be exercised without either program
//! installed.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use stemgate_common::config::ToolsConfig;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt kept in an error
const STDERR_EXCERPT_BYTES: usize = 4096;

/// External tool failure
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} could not be started: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code:?}: {stderr}")]
    Exited {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {after:?}")]
    TimedOut { tool: &'static str, after: Duration },

    #[error("{tool} finished but produced no output at {}", .path.display())]
    MissingOutput { tool: &'static str, path: PathBuf },
}

impl ToolError {
    pub fn tool(&self) -> &'static str {
        match self {
            ToolError::Spawn { tool, .. }
            | ToolError::Exited { tool, .. }
            | ToolError::TimedOut { tool, .. }
            | ToolError::MissingOutput { tool, .. } => *tool,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::TimedOut { .. })
    }
}

/// Audio processing capabilities the job pipeline needs
#[async_trait]
pub trait AudioTools: Send + Sync {
    /// Copy at most `max_duration` of `input` into `output`
    async fn trim(&self, input: &Path, output: &Path, max_duration: Duration)
        -> Result<(), ToolError>;

    /// Split `input` into stems under `output_dir`; returns the folder
    /// holding the stem files
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, ToolError>;
}

/// Folder the separator creates for `input` inside `output_dir`
/// (`<output_dir>/<input file stem>`)
pub fn expected_stem_dir(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "stems".into());
    output_dir.join(stem)
}

/// [`AudioTools`] backed by `ffmpeg` and `spleeter` processes
#[derive(Debug, Clone)]
pub struct CommandTools {
    config: ToolsConfig,
}

impl CommandTools {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    pub fn model(&self) -> &str {
        &self.config.separator_model
    }
}

#[async_trait]
impl AudioTools for CommandTools {
    async fn trim(
        &self,
        input: &Path,
        output: &Path,
        max_duration: Duration,
    ) -> Result<(), ToolError> {
        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-t")
            .arg(max_duration.as_secs().to_string())
            .arg("-c")
            .arg("copy")
            .arg(output);

        run_with_timeout("ffmpeg", command, self.config.trim_timeout()).await?;

        if !output.exists() {
            return Err(ToolError::MissingOutput {
                tool: "ffmpeg",
                path: output.to_path_buf(),
            });
        }
        Ok(())
    }

    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, ToolError> {
        let mut command = Command::new(&self.config.spleeter_path);
        command
            .arg("separate")
            .arg("-p")
            .arg(&self.config.separator_model)
            .arg("-o")
            .arg(output_dir)
            .arg(input);

        run_with_timeout("spleeter", command, self.config.separate_timeout()).await?;

        let stem_dir = expected_stem_dir(input, output_dir);
        if !stem_dir.is_dir() {
            return Err(ToolError::MissingOutput {
                tool: "spleeter",
                path: stem_dir,
            });
        }
        Ok(stem_dir)
    }
}

/// Run `command` to completion, killing it if `timeout` passes first
///
/// A zero exit status is success; anything else becomes
/// [`ToolError::Exited`] carrying the tail of stderr.
pub async fn run_with_timeout(
    tool: &'static str,
    mut command: Command,
    timeout: Duration,
) -> Result<(), ToolError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool, timeout_secs = timeout.as_secs(), "Starting external tool");
    let child = command
        .spawn()
        .map_err(|source| ToolError::Spawn { tool, source })?;

    // Dropping the wait future on timeout drops the child, which kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(ToolError::Spawn { tool, source }),
        Err(_) => {
            warn!(tool, timeout_secs = timeout.as_secs(), "External tool timed out, killed");
            return Err(ToolError::TimedOut {
                tool,
                after: timeout,
            });
        }
    };

    if output.status.success() {
        debug!(tool, "External tool finished");
        return Ok(());
    }

    Err(ToolError::Exited {
        tool,
        code: output.status.code(),
        stderr: stderr_excerpt(&output.stderr),
    })
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_EXCERPT_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
