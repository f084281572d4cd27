use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use wakegate::clock::{SharedClock, SystemClock};
use wakegate::config::Config;
use wakegate::db::Database;
use wakegate::docker::{DockerProvisioner, LocalFleet};
use wakegate::events::EventRouter;
use wakegate::fleet::FleetController;
use wakegate::lease::{SharedLeaseStore, SqliteLeaseStore};
use wakegate::monitor::HttpProber;
use wakegate::orchestrator::Launcher;
use wakegate::provider::{SharedFleetApi, SharedProvisioner};
use wakegate::registration::NameRegistrar;
use wakegate::server::{AppState, LaunchServer, PKG_NAME, VERSION};

/// Buffered unit events between the event watcher and the router
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = load_config(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let clock: SharedClock = Arc::new(SystemClock);
    let db = Database::open(&config.store.path)?;
    let leases: SharedLeaseStore = Arc::new(SqliteLeaseStore::new(db.clone(), clock.clone()));

    let docker = Arc::new(DockerProvisioner::connect(&config.provisioning, &config.templates).await?);
    let provisioner: SharedProvisioner = docker.clone();
    let fleet_api: SharedFleetApi = Arc::new(LocalFleet::new());

    let fleet = Arc::new(FleetController::new(
        provisioner.clone(),
        fleet_api,
        leases.clone(),
        clock.clone(),
        config.provisioning.pool.clone(),
        config.fleet.clone(),
    ));
    let launcher = Arc::new(Launcher::new(
        &config,
        provisioner,
        leases,
        Arc::clone(&fleet),
        Arc::new(HttpProber::new()?),
        clock.clone(),
    ));
    let registrar = Arc::new(NameRegistrar::new(Arc::new(db), clock, &config.registration));

    // A single slot: triggers arriving while one is queued are coalesced
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let events = Arc::new(EventRouter::new(registrar, trigger_tx));

    // Fleet controller
    let fleet_task = {
        let fleet = Arc::clone(&fleet);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { fleet.run(trigger_rx, shutdown_rx).await })
    };

    // Unit events from the daemon feed the router
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    {
        let docker = Arc::clone(&docker);
        let pool = config.provisioning.pool.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { docker.watch_events(&pool, events_tx, shutdown_rx).await });
    }
    {
        let events = Arc::clone(&events);
        tokio::spawn(async move { events.run(events_rx).await });
    }

    // Launch service
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(AppState {
        launcher,
        fleet,
        events,
    });
    let server = LaunchServer::new(bind_addr, state, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Launch service error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = fleet_task.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Load the file if present, otherwise start from defaults; environment
/// overrides apply either way.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let config = Config::load(path)?;
        info!(path = %path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %path.display(), "No configuration file, using defaults");
        Config::default()
    };
    config.apply_env(std::env::vars())?;
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting launch service");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        store = %config.store.path.display(),
        "Server configuration"
    );
    info!(
        pool = %config.provisioning.pool,
        frontend_template = %config.templates.frontend.id,
        backend_template = %config.templates.backend.id,
        domain = config.registration.domain.as_deref().unwrap_or("-"),
        "Provisioning configuration"
    );
    info!(
        lease_ttl_secs = config.launch.lease_ttl_secs,
        request_timeout_secs = config.launch.request_timeout_secs,
        max_units_per_host = config.fleet.max_units_per_host,
        "Launch settings"
    );
}
