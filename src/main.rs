use devgate::admin::{PKG_NAME, VERSION};
use devgate::apps::{AppPool, PoolOptions};
use devgate::config::Config;
use devgate::events::Events;
use devgate::proxy::{ProxyServer, Router};
use devgate::tls::{self, CertificateAuthority, CertificateCache};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so `debug` can raise the level
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("devgate.toml"));

    let config = Config::load(&config_path);

    let level = match config {
        Ok(ref c) if c.server.debug => "devgate=debug",
        _ => "devgate=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse().expect("valid log directive")),
        )
        .init();

    let config = config.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

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

    let apps_dir = config.apps_dir();
    std::fs::create_dir_all(&apps_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create apps directory '{}': {}", apps_dir.display(), e)
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let events = Arc::new(Events::new());
    let apps = AppPool::new(&apps_dir, PoolOptions::from_config(&config), events);
    let router = Router::new(Arc::clone(&apps), &config.server);

    // HTTPS needs the local CA; any problem with it is fatal
    let tls_acceptor = if config.server.https_port > 0 {
        let support_dir = config.support_dir();
        let ca = CertificateAuthority::load_or_generate(&support_dir, config.tls.trust).map_err(|e| {
            error!(dir = %support_dir.display(), error = %e, "Unable to set up the certificate authority");
            anyhow::anyhow!("Certificate authority setup failed: {}", e)
        })?;
        info!(cert = %ca.cert_path().display(), "Certificate authority ready");

        let cache = Arc::new(CertificateCache::new(Arc::new(ca), config.tls.cache_capacity));
        let tls_config = tls::server_config(cache)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let http_handle = if config.server.http_port > 0 {
        let addr = bind_addr(&config.server.bind, config.server.http_port)?;
        let server = ProxyServer::new(addr, Arc::clone(&router), shutdown_rx.clone());
        Some(spawn_server(server, "HTTP"))
    } else {
        None
    };

    let https_handle = match tls_acceptor {
        Some(acceptor) => {
            let addr = bind_addr(&config.server.bind, config.server.https_port)?;
            let server = ProxyServer::new(addr, Arc::clone(&router), shutdown_rx.clone()).with_tls(acceptor);
            Some(spawn_server(server, "HTTPS"))
        }
        None => None,
    };

    wait_for_shutdown(&apps).await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all apps...");
    apps.purge().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
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

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn spawn_server(server: ProxyServer, protocol: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(protocol, error = %e, "Server error");
        }
    })
}

/// Block until a stop signal arrives. SIGUSR1 stops every app and keeps
/// serving.
#[cfg(unix)]
async fn wait_for_shutdown(apps: &Arc<AppPool>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sigquit.recv() => {
                info!("Received SIGQUIT, shutting down...");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, stopping all apps");
                apps.purge().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_apps: &Arc<AppPool>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
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

        // Try to acquire exclusive lock (non-blocking)
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
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

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting devgate");
    let http_port = config.server.http_port;
    let https_port = config.server.https_port;
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        domains = ?config.server.domains,
        admin_host = %config.server.admin_host,
        "Server configuration"
    );
    info!(
        dir = %config.apps_dir().display(),
        idle_timeout_secs = config.apps.idle_timeout_secs,
        boot_timeout_secs = config.apps.boot_timeout_secs,
        "App settings"
    );
}
