//! Monthly traffic ledger
//!
//! Tracks upload + download bytes against a fixed budget per 30-day period and
//! persists the running total so it survives restarts.
//!
//! # Period semantics
//!
//! The period is a fixed window, not a sliding one. Every operation first checks
//! whether more than 30 days have passed since `period_start`; if so the total
//! drops to zero and a new period starts at "now". Because the check runs before
//! every read, a stale total from the previous period is never reported.
//!
//! # Persistence
//!
//! The full state is rewritten after every mutation (including rollovers) as
//! `{"used_bytes", "month_start", "last_update"}` with unix-second timestamps.
//! A failed write is logged and otherwise ignored: the in-memory total remains
//! authoritative for the life of the process and the next successful write
//! brings the file back in line.
//!
//! Any method may trigger a rollover, and every rollover or mutation writes the
//! file while the state lock is held. Async callers run ledger calls on the
//! blocking pool (`tokio::task::spawn_blocking`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use stemgate_common::time::from_unix_seconds;
use stemgate_common::Clock;
use thiserror::Error;
use tracing::{error, info, warn};

/// Length of one ledger period
pub const PERIOD_DAYS: i64 = 30;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Ledger file could not be written
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Running total for the current period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerState {
    pub used_bytes: u64,
    pub period_start: DateTime<Utc>,
}

impl LedgerState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            used_bytes: 0,
            period_start: truncate_to_second(now),
        }
    }

    /// When the current period ends
    pub fn resets_at(&self) -> DateTime<Utc> {
        self.period_start + Duration::days(PERIOD_DAYS)
    }
}

/// On-disk representation written after every mutation
#[derive(Debug, Serialize)]
struct LedgerFile {
    used_bytes: u64,
    month_start: i64,
    last_update: i64,
}

/// Lenient reader: older files carry float timestamps and may omit fields
#[derive(Debug, Deserialize)]
struct StoredLedger {
    #[serde(default)]
    used_bytes: u64,
    #[serde(default)]
    month_start: Option<f64>,
}

/// Read-only view served by the admin traffic endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub limit_bytes: u64,
    pub used_bytes: u64,
    pub remaining_bytes: u64,
    pub used_percent: f64,
    pub limit_gb: f64,
    pub used_gb: f64,
    pub remaining_gb: f64,
    pub period_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
    pub limit_reached: bool,
}

/// Persistent monthly traffic budget
///
/// All operations are serialized by a single mutex; the ledger is the only
/// writer of its backing file.
pub struct TrafficLedger {
    path: PathBuf,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl TrafficLedger {
    /// Load the ledger at `path`, starting a fresh period if the file is
    /// missing or unreadable
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let now = clock.now();

        let (state, needs_write) = match load_state(&path, now) {
            Ok(Some(state)) => {
                info!(
                    used_gb = round_to(state.used_bytes as f64 / BYTES_PER_GB, 2),
                    period_start = %state.period_start.format("%Y-%m-%d"),
                    "Traffic ledger loaded"
                );
                (state, false)
            }
            Ok(None) => {
                info!(path = %path.display(), "No traffic ledger found, starting from zero");
                (LedgerState::fresh(now), true)
            }
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    error = %reason,
                    "Traffic ledger unreadable, starting a fresh period"
                );
                (LedgerState::fresh(now), true)
            }
        };

        let ledger = Self {
            path,
            max_bytes,
            clock,
            state: Mutex::new(state),
        };

        {
            let mut state = ledger.lock();
            let rolled = ledger.roll_over_if_due(&mut state);
            if needs_write && !rolled {
                ledger.persist_or_log(&state);
            }
        }

        ledger
    }

    /// Record bytes transferred by one job
    pub fn add_traffic(&self, upload_bytes: u64, download_bytes: u64) {
        let mut state = self.lock();
        self.roll_over_if_due(&mut state);

        state.used_bytes = state
            .used_bytes
            .saturating_add(upload_bytes.saturating_add(download_bytes));
        self.persist_or_log(&state);

        let percent = percent_of(state.used_bytes, self.max_bytes);
        if percent > 90.0 {
            warn!(
                used_percent = round_to(percent, 1),
                used_gb = round_to(state.used_bytes as f64 / BYTES_PER_GB, 2),
                limit_gb = round_to(self.max_bytes as f64 / BYTES_PER_GB, 1),
                "Monthly traffic above 90% of limit"
            );
        } else if percent > 75.0 {
            info!(
                used_percent = round_to(percent, 1),
                "Monthly traffic above 75% of limit"
            );
        }
    }

    /// Whether the budget for the current period is spent
    pub fn is_limit_reached(&self) -> bool {
        let mut state = self.lock();
        if self.roll_over_if_due(&mut state) {
            return false;
        }
        state.used_bytes >= self.max_bytes
    }

    /// Share of the budget used, unclamped (may exceed 100)
    pub fn usage_percent(&self) -> f64 {
        let mut state = self.lock();
        if self.roll_over_if_due(&mut state) {
            return 0.0;
        }
        percent_of(state.used_bytes, self.max_bytes)
    }

    /// Bytes left before the limit, zero once it is reached
    pub fn remaining_bytes(&self) -> u64 {
        let mut state = self.lock();
        self.roll_over_if_due(&mut state);
        self.max_bytes.saturating_sub(state.used_bytes)
    }

    /// Current state after applying any due rollover
    pub fn state(&self) -> LedgerState {
        let mut state = self.lock();
        self.roll_over_if_due(&mut state);
        *state
    }

    /// When the budget is spent: the period end and whole seconds until it
    ///
    /// Evaluated under one lock so the two figures agree with the limit check.
    pub fn exhausted_until(&self) -> Option<(DateTime<Utc>, u64)> {
        let mut state = self.lock();
        if self.roll_over_if_due(&mut state) || state.used_bytes < self.max_bytes {
            return None;
        }
        let resets_at = state.resets_at();
        let secs = (resets_at - self.clock.now()).num_seconds().max(0) as u64;
        Some((resets_at, secs))
    }

    /// Whole seconds until the current period ends
    pub fn seconds_until_reset(&self) -> u64 {
        let mut state = self.lock();
        self.roll_over_if_due(&mut state);
        (state.resets_at() - self.clock.now()).num_seconds().max(0) as u64
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent view of every figure at one instant
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut state = self.lock();
        self.roll_over_if_due(&mut state);

        let remaining = self.max_bytes.saturating_sub(state.used_bytes);
        LedgerSnapshot {
            limit_bytes: self.max_bytes,
            used_bytes: state.used_bytes,
            remaining_bytes: remaining,
            used_percent: round_to(percent_of(state.used_bytes, self.max_bytes), 1),
            limit_gb: round_to(self.max_bytes as f64 / BYTES_PER_GB, 1),
            used_gb: round_to(state.used_bytes as f64 / BYTES_PER_GB, 2),
            remaining_gb: round_to(remaining as f64 / BYTES_PER_GB, 2),
            period_start: state.period_start,
            resets_at: state.resets_at(),
            limit_reached: state.used_bytes >= self.max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new period if the current one is over. Returns true on rollover.
    fn roll_over_if_due(&self, state: &mut LedgerState) -> bool {
        let now = self.clock.now();
        if now - state.period_start <= Duration::days(PERIOD_DAYS) {
            return false;
        }

        info!(
            previous_used_gb = round_to(state.used_bytes as f64 / BYTES_PER_GB, 2),
            previous_period_start = %state.period_start.format("%Y-%m-%d"),
            "Traffic ledger period rolled over"
        );
        *state = LedgerState::fresh(now);
        self.persist_or_log(state);
        true
    }

    fn persist_or_log(&self, state: &LedgerState) {
        if let Err(e) = self.persist(state) {
            error!(
                path = %self.path.display(),
                error = %e,
                used_bytes = state.used_bytes,
                "Failed to persist traffic ledger, keeping in-memory state"
            );
        }
    }

    /// Rewrite the ledger file through a temp file + rename
    fn persist(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let file = LedgerFile {
            used_bytes: state.used_bytes,
            month_start: state.period_start.timestamp(),
            last_update: self.clock.now().timestamp(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp_path = temp_path_for(&self.path);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// `Ok(None)` when there is no file; `Err` with a reason when it cannot be used
fn load_state(path: &Path, now: DateTime<Utc>) -> Result<Option<LedgerState>, String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };

    let stored: StoredLedger = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    let period_start = match stored.month_start {
        Some(secs) if secs.is_finite() => from_unix_seconds(secs.floor() as i64),
        Some(_) => return Err("month_start is not a finite number".to_string()),
        None => truncate_to_second(now),
    };

    Ok(Some(LedgerState {
        used_bytes: stored.used_bytes,
        period_start,
    }))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "traffic_state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_unix_seconds(ts.timestamp())
}

fn percent_of(used: u64, max: u64) -> f64 {
    if max == 0 {
        // A zero budget is always exhausted
        return 100.0;
    }
    used as f64 / max as f64 * 100.0
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
