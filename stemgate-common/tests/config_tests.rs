//! Integration tests for configuration loading and graceful degradation
//!
//! Covers:
//! - Missing TOML files SHALL NOT prevent startup
//! - Malformed TOML files are reported
//! - Priority order for root folder resolution
//! - Managed directory creation
//! - Environment overrides of resource limits
//!
//! Note: Uses serial_test to prevent ENV variable race conditions.
//! Tests that manipulate STEMGATE_* variables are marked with #[serial].

use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use stemgate_common::config::{
    default_root_folder, load_toml_config, resolve_root_folder, RootLayout, ROOT_FOLDER_ENV,
};
use stemgate_common::{Error, ResourceLimits};
use tempfile::TempDir;

// =============================================================================
// TOML loading
// =============================================================================

#[test]
fn test_missing_toml_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.limits, ResourceLimits::default());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.server.port, 5730);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "[limits\nmax_ram_mb = ").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_full_toml_round_trip_of_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/data/stemgate"

[server]
host = "0.0.0.0"
port = 9000

[logging]
level = "debug"

[limits]
max_ram_mb = 2048
max_cpu_percent = 180.0
max_storage_mb = 500
max_file_mb = 20
max_concurrent_requests = 1
max_duration_sec = 30
retention_minutes = 10
monthly_traffic_cap_bytes = 1073741824

[tools]
ffmpeg_path = "/usr/local/bin/ffmpeg"
separator_model = "spleeter:4stems"
separate_timeout_secs = 300

[sweeper]
interval_secs = 600

[metrics]
sample_interval_secs = 15
history_capacity = 100
"#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/data/stemgate")));
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.limits.max_ram_mb, 2048);
    assert_eq!(config.limits.max_concurrent_requests, 1);
    assert_eq!(config.limits.monthly_traffic_cap_bytes, 1_073_741_824);
    assert_eq!(config.tools.ffmpeg_path, "/usr/local/bin/ffmpeg");
    assert_eq!(config.tools.spleeter_path, "spleeter");
    assert_eq!(config.tools.separator_model, "spleeter:4stems");
    assert_eq!(config.tools.trim_timeout_secs, 30);
    assert_eq!(config.tools.separate_timeout_secs, 300);
    assert_eq!(config.sweeper.interval_secs, 600);
    assert_eq!(config.metrics.history_capacity, 100);
    assert!(config.limits.validate().is_ok());
}

// =============================================================================
// Root folder resolution
// =============================================================================

#[test]
#[serial]
fn test_cli_argument_wins() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/stemgate-env");
    let resolved = resolve_root_folder(
        Some(Path::new("/tmp/stemgate-cli")),
        ROOT_FOLDER_ENV,
        Some(Path::new("/tmp/stemgate-toml")),
    );
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/stemgate-cli"));
}

#[test]
#[serial]
fn test_env_var_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/stemgate-env");
    let resolved =
        resolve_root_folder(None, ROOT_FOLDER_ENV, Some(Path::new("/tmp/stemgate-toml")));
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/stemgate-env"));
}

#[test]
#[serial]
fn test_toml_used_without_cli_or_env() {
    env::remove_var(ROOT_FOLDER_ENV);
    let resolved =
        resolve_root_folder(None, ROOT_FOLDER_ENV, Some(Path::new("/tmp/stemgate-toml")));
    assert_eq!(resolved, PathBuf::from("/tmp/stemgate-toml"));
}

#[test]
#[serial]
fn test_falls_back_to_compiled_default() {
    env::remove_var(ROOT_FOLDER_ENV);
    let resolved = resolve_root_folder(None, ROOT_FOLDER_ENV, None);
    assert_eq!(resolved, default_root_folder());
    assert!(!resolved.as_os_str().is_empty());
}

// =============================================================================
// Limits from environment
// =============================================================================

#[test]
#[serial]
fn test_env_overrides_from_process_environment() {
    env::set_var("STEMGATE_MAX_FILE_MB", "25");
    env::set_var("STEMGATE_RETENTION_MINUTES", "5");

    let mut limits = ResourceLimits::default();
    let result = limits.apply_env_overrides();

    env::remove_var("STEMGATE_MAX_FILE_MB");
    env::remove_var("STEMGATE_RETENTION_MINUTES");

    result.unwrap();
    assert_eq!(limits.max_file_mb, 25);
    assert_eq!(limits.retention_minutes, 5);
}

// =============================================================================
// Directory layout
// =============================================================================

#[test]
fn test_layout_creates_managed_directories() {
    let temp_dir = TempDir::new().unwrap();
    let layout = RootLayout::new(temp_dir.path().join("nested").join("root"));

    layout.ensure_directories().unwrap();
    assert!(layout.upload_dir().is_dir());
    assert!(layout.output_dir().is_dir());

    // Idempotent
    layout.ensure_directories().unwrap();
}
