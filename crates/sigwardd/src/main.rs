//! sigward daemon - stops containers whose image signature does not verify.

use anyhow::{Context, Result};
use clap::Parser;
use sigward_common::SigwardError;
use sigwardd::config::{self, Config, ConfigError};
use sigwardd::{
    metrics, AlertSinks, CosignOracle, DockerClient, Enforcer, EnforcerMetrics, JsonlAlertSink,
    LogAlertSink, Supervisor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sigwardd",
    version,
    about = "Stops containers whose image signature fails verification"
)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = config::CONFIG_PATH)]
    config: PathBuf,

    /// Engine socket, overrides docker.socket_path
    #[arg(long)]
    docker_socket: Option<PathBuf>,

    /// cosign public key, overrides oracle.key_path
    #[arg(long)]
    key: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[FATAL] {:#}", e);
            std::process::exit(exit_code(&e));
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if let Err(e) = run(config, args.check_config).await {
        error!("[FATAL] {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config =
        Config::load(&args.config).map_err(|e| SigwardError::Config(format!("{:#}", e)))?;

    if let Some(socket) = &args.docker_socket {
        config.docker.socket_path = socket.clone();
    }
    if let Some(key) = &args.key {
        config.oracle.key_path = Some(key.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    Ok(config)
}

fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<SigwardError>()
        .map(SigwardError::exit_code)
        .unwrap_or(1)
}

async fn run(config: Config, check_only: bool) -> Result<()> {
    info!("[BOOT] sigwardd v{} starting", env!("CARGO_PKG_VERSION"));

    config
        .validate()
        .map_err(|e| SigwardError::Config(e.to_string()))?;
    let key_path = config
        .oracle
        .resolved_key_path()
        .ok_or_else(|| SigwardError::Config(ConfigError::NoKey.to_string()))?;
    info!("[BOOT] Verifying images against {}", key_path.display());

    if check_only {
        info!("Configuration OK");
        return Ok(());
    }

    if which::which(&config.oracle.cosign_path).is_err() {
        warn!(
            "[BOOT] {} not found; every new container will fail verification and be stopped",
            config.oracle.cosign_path.display()
        );
    }

    let docker = Arc::new(DockerClient::new(&config.docker));
    docker.ping().await.map_err(|e| {
        SigwardError::Engine(format!(
            "engine at {}: {}",
            config.docker.socket_path.display(),
            e
        ))
    })?;
    info!("[BOOT] Engine reachable at {}", config.docker.socket_path.display());

    let metrics = Arc::new(EnforcerMetrics::new().context("Failed to register metrics")?);
    if let Some(addr) = config.metrics.listen {
        let exported = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, exported).await {
                error!("{:#}", e);
            }
        });
    }

    let mut alerts = AlertSinks::new().with(Arc::new(LogAlertSink));
    if let Some(path) = &config.audit.path {
        info!("[BOOT] Recording remediation failures in {}", path.display());
        alerts = alerts.with(Arc::new(JsonlAlertSink::new(path)));
    }

    let stop_options = config.remediation.stop_options();
    match stop_options.timeout {
        Some(grace) => info!("[BOOT] Stop grace period {}s", grace.as_secs()),
        None => info!("[BOOT] Stop grace period left to the engine"),
    }

    let oracle = Arc::new(CosignOracle::from_config(&config.oracle, &key_path));
    let enforcer = Enforcer::new(docker.clone(), oracle, docker.clone())
        .with_alerts(Arc::new(alerts))
        .with_metrics(Arc::clone(&metrics))
        .with_stop_options(stop_options)
        .with_max_concurrent(config.enforcement.max_concurrent);
    if enforcer.max_concurrent() > 1 {
        info!(
            "[BOOT] Up to {} adjudications in flight; delivery order is not preserved",
            enforcer.max_concurrent()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx)?;

    let mut supervisor = Supervisor::new(docker, enforcer, &config.reconnect).with_metrics(metrics);
    supervisor
        .run(shutdown_rx)
        .await
        .map_err(|e| SigwardError::Transport(e.to_string()))?;

    info!("Shutting down gracefully");
    Ok(())
}

/// SIGINT or SIGTERM request shutdown; in-flight adjudications finish first
fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        let _ = shutdown.send(true);
    });

    Ok(())
}
