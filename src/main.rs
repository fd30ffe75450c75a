use project_proxy::config::Config;
use project_proxy::docker::{DockerRuntime, SharedRuntime};
use project_proxy::lifecycle::{LifecycleController, StartPolicy};
use project_proxy::proxy::{AppState, ProxyServer};
use project_proxy::watchdog::IdleWatchdog;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "project-proxy.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("project_proxy=debug".parse().expect("valid log directive")),
        )
        .init();

    // An explicit path must exist; the default one is optional
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::load_or_default(DEFAULT_CONFIG_PATH).map_err(|e| {
            error!(path = DEFAULT_CONFIG_PATH, error = %e, "Failed to load configuration");
            e
        })?,
    };

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime: SharedRuntime = Arc::new(
        DockerRuntime::connect(
            config.lifecycle.docker_host.as_deref(),
            config.lifecycle.stop_timeout(),
        )
        .await?,
    );
    let lifecycle = LifecycleController::new(runtime, StartPolicy::from(&config.lifecycle));

    let listen_addr = config.server.listen_addr()?;
    let watchdog_interval = config.watchdog.interval();
    let stop_timeout = config.lifecycle.stop_timeout();
    let state = AppState::new(config, Arc::clone(&lifecycle));

    // Spawn idle watchdog
    let watchdog = IdleWatchdog::new(
        Arc::clone(&state.registry),
        Arc::clone(&lifecycle),
        watchdog_interval,
        stop_timeout,
    );
    let watchdog_handle = tokio::spawn(watchdog.run(shutdown_rx.clone()));

    // Spawn proxy server
    let server = ProxyServer::bind(listen_addr, state, shutdown_rx).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    lifecycle.shutdown();

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = watchdog_handle.await;
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

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the proxy");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                return;
            }
        };

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
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
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
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // The lock lives as long as the handle
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting project proxy"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        api_token = config.server.api_token.is_some(),
        request_timeout_secs = config.server.request_timeout_secs,
        holding_refresh_secs = config.server.holding_refresh_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        registry = %config.storage.registry_path.display(),
        visitor_log = %config.storage.visitor_log_path.display(),
        visitor_log_cap = config.storage.visitor_log_cap,
        "Storage"
    );
    info!(
        docker_host = config.lifecycle.docker_host.as_deref().unwrap_or("(local default)"),
        start_poll_interval_ms = config.lifecycle.start_poll_interval_ms,
        start_timeout_secs = config.lifecycle.start_timeout_secs,
        settle_delay_ms = config.lifecycle.settle_delay_ms,
        stop_timeout_secs = config.lifecycle.stop_timeout_secs,
        "Lifecycle settings"
    );
    info!(interval_secs = config.watchdog.interval_secs, "Idle watchdog settings");
}
