//! stemgate-server - Main entry point
//!
//! Audio stem separation service with admission control: host load ceilings,
//! a hard concurrency cap, a storage ceiling and a monthly traffic budget.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stemgate_common::config::{
    default_config_path, load_toml_config, resolve_root_folder, RootLayout, ROOT_FOLDER_ENV,
};
use stemgate_common::SystemClock;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stemgate_server::guard::{CachedSampler, HostSampler, SysinfoSampler};
use stemgate_server::ledger::TrafficLedger;
use stemgate_server::metrics::{run_sampling_loop, MetricsRecorder};
use stemgate_server::storage::StorageAccountant;
use stemgate_server::sweeper::RetentionSweeper;
use stemgate_server::tools::CommandTools;
use stemgate_server::{build_info, build_router, AppState};

/// Command-line arguments for stemgate-server
#[derive(Parser, Debug)]
#[command(name = "stemgate-server")]
#[command(about = "Audio stem separation service with admission control")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "STEMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder for uploads, outputs and the traffic ledger
    #[arg(short, long, env = "STEMGATE_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "STEMGATE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(default_config_path)
        .unwrap_or_else(|| PathBuf::from("stemgate.toml"));
    let config = load_toml_config(&config_path).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "stemgate_server={level},stemgate_common={level},tower_http={level}",
                    level = config.logging.level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let build = build_info();
    info!(
        "Starting stemgate-server v{} [{}] built {} ({}, {})",
        build.version, build.git_hash, build.timestamp, build.profile, build.target
    );
    if config_path.exists() {
        info!("Configuration file: {}", config_path.display());
    } else {
        warn!(
            "Configuration file {} not found, using built-in defaults",
            config_path.display()
        );
    }

    config.validate().context("Invalid configuration")?;
    let mut limits = config.limits.clone();
    limits
        .apply_env_overrides()
        .context("Invalid resource limit override")?;
    limits.validate().context("Invalid resource limits")?;
    let limits = Arc::new(limits);
    info!(
        max_ram_mb = limits.max_ram_mb,
        max_cpu_percent = limits.max_cpu_percent,
        max_storage_mb = limits.max_storage_mb,
        max_file_mb = limits.max_file_mb,
        max_concurrent_requests = limits.max_concurrent_requests,
        max_duration_sec = limits.max_duration_sec,
        retention_minutes = limits.retention_minutes,
        monthly_traffic_cap_bytes = limits.monthly_traffic_cap_bytes,
        "Resource limits"
    );

    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    let layout = RootLayout::new(&root_folder);
    layout
        .ensure_directories()
        .context("Failed to create data directories")?;
    info!("Root folder: {}", root_folder.display());

    let storage = Arc::new(StorageAccountant::new(
        layout.upload_dir(),
        layout.output_dir(),
        limits.max_file_mb,
        limits.max_storage_mb,
    ));
    let ledger = Arc::new(TrafficLedger::open(
        layout.ledger_path(),
        limits.monthly_traffic_cap_bytes,
        Arc::new(SystemClock),
    ));
    let metrics = Arc::new(MetricsRecorder::new(config.metrics.history_capacity));
    let sampler: Arc<dyn HostSampler> = Arc::new(CachedSampler::new(
        SysinfoSampler::new(),
        Duration::from_millis(config.metrics.host_refresh_ms),
    ));
    let tools = CommandTools::new(config.tools.clone());
    let model = tools.model().to_string();

    let state = AppState::new(
        Arc::clone(&limits),
        Arc::clone(&sampler),
        ledger,
        Arc::clone(&storage),
        Arc::clone(&metrics),
        Arc::new(tools),
        model,
    );

    let background = CancellationToken::new();

    let sweeper = RetentionSweeper::new(
        vec![layout.upload_dir(), layout.output_dir()],
        limits.retention(),
        Duration::from_secs(config.sweeper.interval_secs),
    );
    let sweeper_task = tokio::spawn(sweeper.run(background.clone()));

    let sampler_task = tokio::spawn(run_sampling_loop(
        metrics,
        sampler,
        storage,
        Duration::from_secs(config.metrics.sample_interval_secs),
        background.clone(),
    ));

    let app = build_router(state);

    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, port))?;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    background.cancel();
    let (sweeper_result, sampler_result) = tokio::join!(sweeper_task, sampler_task);
    for (name, result) in [("sweeper", sweeper_result), ("sampler", sampler_result)] {
        if let Err(e) = result {
            warn!("Background {} task ended abnormally: {}", name, e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
