//! Configuration loading and root folder resolution
//!
//! Two layers, both read once at startup and immutable afterwards:
//! 1. **TOML bootstrap**: listen address, root folder, logging, tool settings
//! 2. **Resource limits**: ceilings enforced by admission control, taken from the
//!    `[limits]` table and overridable per field through `STEMGATE_<FIELD>`
//!    environment variables
//!
//! Missing configuration never prevents startup: a missing TOML file logs a
//! warning and falls back to built-in defaults. A TOML file that exists but
//! cannot be parsed is an error, since silently ignoring it would hide typos in
//! limits.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "STEMGATE_ROOT_FOLDER";

/// Prefix for per-limit environment overrides (e.g. `STEMGATE_MAX_RAM_MB`)
pub const LIMIT_ENV_PREFIX: &str = "STEMGATE_";

const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

// ============================================================================
// Resource Limits
// ============================================================================

/// Ceilings enforced by the admission layer
///
/// Defaults keep roughly 20% headroom on an 8 GB / 4 core host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Host RAM in use above which new jobs are refused
    pub max_ram_mb: u64,
    /// Summed per-core CPU usage above which new jobs are refused (300 = three busy cores)
    pub max_cpu_percent: f64,
    /// Ceiling for everything under the upload and output directories
    pub max_storage_mb: u64,
    /// Largest accepted upload
    pub max_file_mb: u64,
    /// Jobs allowed in flight at once
    pub max_concurrent_requests: usize,
    /// Inputs are trimmed to this length before separation
    pub max_duration_sec: u64,
    /// Age after which the sweeper reclaims transient files
    pub retention_minutes: u64,
    /// Upload + download budget per ledger period
    pub monthly_traffic_cap_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_ram_mb: 7000,
            max_cpu_percent: 300.0,
            max_storage_mb: 9000,
            max_file_mb: 50,
            max_concurrent_requests: 2,
            max_duration_sec: 45,
            retention_minutes: 30,
            monthly_traffic_cap_bytes: 10 * BYTES_PER_GB,
        }
    }
}

impl ResourceLimits {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.max_storage_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_sec)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes.saturating_mul(60))
    }

    /// Reject combinations that would make the service refuse every job
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.max_file_mb == 0 {
            return Err(Error::Config("max_file_mb must be at least 1".to_string()));
        }
        if self.max_file_mb > self.max_storage_mb {
            return Err(Error::Config(format!(
                "max_file_mb ({}) exceeds max_storage_mb ({})",
                self.max_file_mb, self.max_storage_mb
            )));
        }
        if !self.max_cpu_percent.is_finite() || self.max_cpu_percent <= 0.0 {
            return Err(Error::Config(
                "max_cpu_percent must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `STEMGATE_<FIELD>` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production)
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_field(&lookup, "MAX_RAM_MB", &mut self.max_ram_mb)?;
        override_field(&lookup, "MAX_CPU_PERCENT", &mut self.max_cpu_percent)?;
        override_field(&lookup, "MAX_STORAGE_MB", &mut self.max_storage_mb)?;
        override_field(&lookup, "MAX_FILE_MB", &mut self.max_file_mb)?;
        override_field(
            &lookup,
            "MAX_CONCURRENT_REQUESTS",
            &mut self.max_concurrent_requests,
        )?;
        override_field(&lookup, "MAX_DURATION_SEC", &mut self.max_duration_sec)?;
        override_field(&lookup, "RETENTION_MINUTES", &mut self.retention_minutes)?;
        override_field(
            &lookup,
            "MONTHLY_TRAFFIC_CAP_BYTES",
            &mut self.monthly_traffic_cap_bytes,
        )?;
        Ok(())
    }
}

fn override_field<F, T>(lookup: &F, name: &str, field: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    let key = format!("{LIMIT_ENV_PREFIX}{name}");
    if let Some(raw) = lookup(&key) {
        let parsed = raw
            .trim()
            .parse::<T>()
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'")))?;
        info!("{} overridden from environment: {} -> {}", key, field, parsed);
        *field = parsed;
    }
    Ok(())
}

// ============================================================================
// Bootstrap TOML
// ============================================================================

/// Bootstrap configuration loaded from TOML file
///
/// Every table is optional; omitted values take built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder for uploads, outputs and the traffic ledger
    pub root_folder: Option<PathBuf>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub limits: ResourceLimits,
    pub tools: ToolsConfig,
    pub sweeper: SweeperConfig,
    pub metrics: MetricsConfig,
}

impl TomlConfig {
    /// Reject schedules and timeouts that would stall or spin background work
    ///
    /// Resource limits are checked separately by [`ResourceLimits::validate`]
    /// once environment overrides have been applied.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("tools.trim_timeout_secs", self.tools.trim_timeout_secs),
            ("tools.separate_timeout_secs", self.tools.separate_timeout_secs),
            ("sweeper.interval_secs", self.sweeper.interval_secs),
            ("metrics.sample_interval_secs", self.metrics.sample_interval_secs),
            ("metrics.history_capacity", self.metrics.history_capacity as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5730,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// External tool invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: String,
    pub spleeter_path: String,
    /// Separation model passed to spleeter `-p`
    pub separator_model: String,
    pub trim_timeout_secs: u64,
    pub separate_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            spleeter_path: "spleeter".to_string(),
            separator_model: "spleeter:2stems".to_string(),
            trim_timeout_secs: 30,
            separate_timeout_secs: 120,
        }
    }
}

impl ToolsConfig {
    pub fn trim_timeout(&self) -> Duration {
        Duration::from_secs(self.trim_timeout_secs)
    }

    pub fn separate_timeout(&self) -> Duration {
        Duration::from_secs(self.separate_timeout_secs)
    }
}

/// Retention sweeper schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
        }
    }
}

/// Background resource sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub sample_interval_secs: u64,
    /// Samples retained per series; oldest are evicted first
    pub history_capacity: usize,
    /// Minimum gap between host refreshes; readings inside it are reused
    pub host_refresh_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            history_capacity: 1440,
            host_refresh_ms: 1000,
        }
    }
}

/// Default configuration file path for the platform (`<config dir>/stemgate/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("stemgate").join("config.toml"))
}

/// Load bootstrap configuration
///
/// A missing file yields defaults plus a warning. A present but malformed file
/// is an error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

// ============================================================================
// Root Folder
// ============================================================================

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config `root_folder`
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_root: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_root {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stemgate"))
        .unwrap_or_else(|| PathBuf::from("./stemgate_data"))
}

/// Managed directory layout beneath the root folder
#[derive(Debug, Clone)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    /// Persisted traffic ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("traffic_state.json")
    }

    /// Create the root, upload and output directories if missing
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.root.clone(), self.upload_dir(), self.output_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                info!("Created directory: {}", dir.display());
            }
        }
        Ok(())
    }
}
