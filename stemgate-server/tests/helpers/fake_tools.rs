//! Scripted stand-in for ffmpeg and spleeter

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stemgate_server::tools::{expected_stem_dir, AudioTools, ToolError};
use tokio::sync::Semaphore;

/// How the fake behaves once invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    /// Trim copies the input, separation writes two stems
    Succeed,
    /// Trim exits non-zero with a path in its stderr
    FailTrim,
    /// Separation writes a partial stem, then reports a timeout
    TimeoutSeparate,
}

pub struct FakeTools {
    mode: FakeMode,
    /// When set, separation waits for a permit before producing output
    gate: Option<Arc<Semaphore>>,
    trim_calls: AtomicUsize,
    separate_calls: AtomicUsize,
}

impl FakeTools {
    pub fn new(mode: FakeMode) -> Self {
        Self {
            mode,
            gate: None,
            trim_calls: AtomicUsize::new(0),
            separate_calls: AtomicUsize::new(0),
        }
    }

    /// Separation blocks until `gate` hands out a permit
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(FakeMode::Succeed)
        }
    }

    pub fn trim_calls(&self) -> usize {
        self.trim_calls.load(Ordering::SeqCst)
    }

    /// Jobs that have reached separation (including ones still waiting)
    pub fn separate_calls(&self) -> usize {
        self.separate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioTools for FakeTools {
    async fn trim(
        &self,
        input: &Path,
        output: &Path,
        _max_duration: Duration,
    ) -> Result<(), ToolError> {
        self.trim_calls.fetch_add(1, Ordering::SeqCst);

        if self.mode == FakeMode::FailTrim {
            return Err(ToolError::Exited {
                tool: "ffmpeg",
                code: Some(1),
                stderr: format!("{}: Invalid data found when processing input", input.display()),
            });
        }

        tokio::fs::copy(input, output)
            .await
            .map_err(|source| ToolError::Spawn {
                tool: "ffmpeg",
                source,
            })?;
        Ok(())
    }

    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, ToolError> {
        self.separate_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }

        let stem_dir = expected_stem_dir(input, output_dir);
        let io_err = |source| ToolError::Spawn {
            tool: "spleeter",
            source,
        };
        tokio::fs::create_dir_all(&stem_dir).await.map_err(io_err)?;

        let audio = tokio::fs::read(input).await.map_err(io_err)?;
        tokio::fs::write(stem_dir.join("vocals.wav"), &audio)
            .await
            .map_err(io_err)?;

        if self.mode == FakeMode::TimeoutSeparate {
            return Err(ToolError::TimedOut {
                tool: "spleeter",
                after: Duration::from_secs(120),
            });
        }

        let accompaniment: Vec<u8> = audio.iter().rev().copied().collect();
        tokio::fs::write(stem_dir.join("accompaniment.wav"), accompaniment)
            .await
            .map_err(io_err)?;

        Ok(stem_dir)
    }
}
