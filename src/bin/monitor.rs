//! Health monitor sidecar
//!
//! Usage: wakegate-monitor [config.toml] [frontend|backend] [peer-url]
//!
//! The role defaults to `WAKEGATE_ROLE` and the peer to the address the unit
//! was given at creation.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::clock::SystemClock;
use wakegate::config::Config;
use wakegate::monitor::{
    peer_address_from_env, peer_url, HealthMonitor, HttpProber, MonitorExit, MonitorSettings, SignalTerminator,
};
use wakegate::name::Role;
use wakegate::provider::ENV_ROLE;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = if config_path.exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    } else {
        Config::default()
    };
    config.apply_env(std::env::vars())?;

    let role: Role = match args.next().or_else(|| std::env::var(ENV_ROLE).ok()) {
        Some(raw) => raw.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        None => anyhow::bail!("role required: pass frontend|backend or set {}", ENV_ROLE),
    };

    let peer = match args.next().or_else(|| peer_address_from_env(role, |key| std::env::var(key).ok())) {
        Some(address) => peer_url(&address, &config.monitor),
        None => anyhow::bail!("no peer address for the {} monitor", role),
    };

    let monitor = HealthMonitor::new(
        role,
        peer,
        Arc::new(HttpProber::new()?),
        Arc::new(SignalTerminator::new(config.monitor.terminate)),
        Arc::new(SystemClock),
        MonitorSettings::for_role(&config.monitor, role),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut monitor_task = tokio::spawn(async move { monitor.run(shutdown_rx).await });

    #[cfg(unix)]
    let exit = {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            exit = &mut monitor_task => exit?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                let _ = shutdown_tx.send(true);
                monitor_task.await?
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                let _ = shutdown_tx.send(true);
                monitor_task.await?
            }
        }
    };

    #[cfg(not(unix))]
    let exit = {
        tokio::select! {
            exit = &mut monitor_task => exit?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                let _ = shutdown_tx.send(true);
                monitor_task.await?
            }
        }
    };

    match exit {
        MonitorExit::Shutdown => Ok(()),
        MonitorExit::Terminated { failures } => {
            error!(failures, "Peer lost, monitor exiting");
            std::process::exit(1);
        }
    }
}
