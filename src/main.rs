use relayctl::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use relayctl::config::Config;
use relayctl::db::Database;
use relayctl::error::ControlError;
use relayctl::registration::{RegistrationClient, RegistrationService};
use relayctl::stats::StatsCollector;
use relayctl::supervisor::Supervisor;
use relayctl::synth::Synthesizer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Timeout of a single stats query against the relay
const STATS_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relayctl=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let db = Arc::new(Database::open(&config.database.path)?);

    let synthesizer = Synthesizer::new(db.clone(), db.clone(), &config);
    let supervisor = Supervisor::new(Arc::new(synthesizer), config.process.clone());
    let stats = Arc::new(StatsCollector::new(Arc::clone(&supervisor), STATS_TIMEOUT));

    let registration_client = RegistrationClient::new(&config.registration)?;
    info!(
        base_url = %config.registration.base_url,
        max_retries = registration_client.policy().max_retries,
        pool_max_idle = config.registration.pool_max_idle_per_host,
        "Registration client configured"
    );
    let registration = Arc::new(RegistrationService::new(
        registration_client,
        db.clone(),
        &config.registration,
    ));

    if let Err(e) = supervisor.restart(false).await {
        error!(error = %e, "Initial relay start failed");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.admin_port, error = %e, "Invalid control API bind address");
            anyhow::anyhow!("Invalid control API bind address: {}", e)
        })?;

    let state = Arc::new(AdminState {
        supervisor: Arc::clone(&supervisor),
        stats: Arc::clone(&stats),
        registration,
        db: Arc::clone(&db),
    });
    let admin_server = AdminServer::new(admin_addr, state, shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    let poll_interval = Duration::from_secs(config.traffic.poll_interval_secs);
    let poller = tokio::spawn(poll_loop(
        Arc::clone(&supervisor),
        stats,
        db,
        poll_interval,
        shutdown_rx.clone(),
    ));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

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
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping relay...");
    match supervisor.stop().await {
        Ok(()) | Err(ControlError::NotRunning) => {}
        Err(e) => warn!(error = %e, "Failed to stop relay"),
    }

    // Wait for background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = poller.await;
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Apply pending configuration changes and persist traffic
async fn poll_loop(
    supervisor: Arc<Supervisor>,
    stats: Arc<StatsCollector>,
    db: Arc<Database>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        if supervisor.restart_flag().consume_if_dirty() {
            info!("Configuration marked stale, restarting relay");
            if let Err(e) = supervisor.restart(false).await {
                error!(error = %e, "Failed to apply configuration change");
            }
        }

        match stats.collect_into(&db).await {
            Ok(_) | Err(ControlError::NotRunning) => {}
            Err(e) => debug!(error = %e, "Traffic collection failed"),
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting relay control plane");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        database = %config.database.path.display(),
        "Server configuration"
    );
    info!(
        binary = %config.process.binary.display(),
        config_path = %config.process.config_path.display(),
        monitor_interval_ms = config.process.monitor_interval_ms,
        shutdown_grace_period_secs = config.process.shutdown_grace_period_secs,
        missing_record = ?config.filter.missing_record,
        "Relay configuration"
    );
}
