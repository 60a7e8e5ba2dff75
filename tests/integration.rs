//! Integration tests for devgate
//!
//! Apps are directories whose start command re-runs this test binary as the
//! mock backend on the unix socket devgate hands it.

mod mock_backend;

use devgate::apps::{AppPool, PoolOptions};
use devgate::config::{LaunchConfig, ServerConfig};
use devgate::events::Events;
use devgate::proxy::{ProxyServer, Router};
use devgate::tls::{self, CertificateAuthority, CertificateCache};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A running front door over a temporary apps directory
struct TestGate {
    dir: TempDir,
    apps: Arc<AppPool>,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl TestGate {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with<F: FnOnce(&mut PoolOptions)>(customize: F) -> Self {
        Self::launch(customize, None).await
    }

    /// Serve HTTPS with certificates issued by `ca`
    async fn start_tls(ca: CertificateAuthority) -> Self {
        let cache = Arc::new(CertificateCache::new(Arc::new(ca), 16));
        let config = tls::server_config(cache).unwrap();
        Self::launch(|_| {}, Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    async fn launch<F: FnOnce(&mut PoolOptions)>(customize: F, tls_acceptor: Option<TlsAcceptor>) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut options = PoolOptions {
            idle_timeout: Duration::from_secs(60),
            idle_check_interval: Duration::from_millis(200),
            boot_timeout: Duration::from_secs(10),
            launch: mock_launch_config(),
        };
        customize(&mut options);

        let apps = AppPool::new(dir.path(), options, Arc::new(Events::new()));
        let server = ServerConfig {
            domains: vec!["test".to_string()],
            ..ServerConfig::default()
        };
        let router = Router::new(Arc::clone(&apps), &server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut proxy = ProxyServer::new(listener.local_addr().unwrap(), router, shutdown_rx);
        if let Some(acceptor) = tls_acceptor {
            proxy = proxy.with_tls(acceptor);
            assert!(proxy.tls_enabled());
        }
        tokio::spawn(async move {
            let _ = proxy.serve(listener).await;
        });

        Self {
            dir,
            apps,
            port,
            shutdown_tx,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create a launchable app directory
    fn add_app(&self, name: &str) -> PathBuf {
        let app_dir = self.path().join(name);
        std::fs::create_dir_all(&app_dir).unwrap();
        app_dir
    }

    async fn get(&self, host: &str, path: &str) -> (u16, String) {
        http_get_with_host(self.port, path, host).await.unwrap()
    }

    fn app_events(&self, name: &str) -> Vec<Value> {
        self.apps
            .events()
            .records()
            .into_iter()
            .filter(|r| r["app"] == name)
            .collect()
    }

    async fn wait_for_event(&self, name: &str, event: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.app_events(name).iter().any(|r| r["event"] == event) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.apps.purge().await;
    }
}

impl Drop for TestGate {
    fn drop(&mut self) {
        // Don't leave mock processes behind when a test fails early
        self.apps.for_apps(|app| app.kill("test finished"));
    }
}

/// Entry point of the mock app processes. Only serves when devgate launched
/// this binary with an app socket; a plain `--ignored` run returns at once.
#[tokio::test]
#[ignore]
async fn mock_backend_main() {
    if let (Ok(socket), Ok(name)) = (std::env::var("SOCKET"), std::env::var("APP_NAME")) {
        mock_backend::serve(socket, name).await;
    }
}

fn mock_launch_config() -> LaunchConfig {
    let binary = std::env::current_exe().unwrap();
    let command = format!(
        "{} mock_backend_main --exact --ignored --nocapture --test-threads=1",
        shell_words::quote(&binary.to_string_lossy())
    );
    LaunchConfig {
        shell: Some("/bin/sh".to_string()),
        shell_args: vec!["-c".to_string()],
        command: Some(command),
        ..LaunchConfig::default()
    }
}

/// Send HTTP request with custom Host header, returning status and body
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<(u16, String), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let status = response
        .split_whitespace()
        .nth(1)
        .ok_or("missing status line")?
        .parse()?;
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn bump_mtime(path: &Path) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_boots_app_on_first_request() {
    let gate = TestGate::start().await;
    gate.add_app("hello");

    let (status, body) = gate.get("hello.test", "/").await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body, "Hello from hello (proto=http, path=/)");

    let names: Vec<String> = gate
        .app_events("hello")
        .iter()
        .map(|r| r["event"].as_str().unwrap_or_default().to_string())
        .collect();
    let booting = names.iter().position(|n| n == "booting_app").unwrap();
    let ready = names.iter().position(|n| n == "app_ready").unwrap();
    assert!(booting < ready);

    // The second request reuses the running app
    let app = gate.apps.get("hello").unwrap();
    let (status, _) = gate.get("hello.test:9280", "/again").await;
    assert_eq!(status, 200);
    assert!(Arc::ptr_eq(&app, &gate.apps.get("hello").unwrap()));

    gate.stop().await;
}

#[tokio::test]
async fn test_subdomain_falls_back_to_app() {
    let gate = TestGate::start().await;
    gate.add_app("hello");

    let (status, body) = gate.get("www.hello.test", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("Hello from hello"));

    gate.stop().await;
}

#[tokio::test]
async fn test_unknown_app_returns_500() {
    let gate = TestGate::start().await;

    let (status, body) = gate.get("missing.test", "/").await;
    assert_eq!(status, 500);
    assert_eq!(body, "unknown app");

    // Nothing was created for the unknown name
    assert_eq!(std::fs::read_dir(gate.path()).unwrap().count(), 0);

    gate.stop().await;
}

#[tokio::test]
async fn test_symlink_alias_uses_canonical_name() {
    let gate = TestGate::start().await;
    let target = gate.add_app("hello");
    std::os::unix::fs::symlink(&target, gate.path().join("alias")).unwrap();

    let (status, body) = gate.get("alias.test", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("Hello from hello"), "{}", body);

    let (_, _) = gate.get("hello.test", "/").await;
    let alias = gate.apps.get("alias").unwrap();
    let canonical = gate.apps.get("hello").unwrap();
    assert!(Arc::ptr_eq(&alias, &canonical));

    gate.stop().await;
}

#[tokio::test]
async fn test_failed_boot_returns_500() {
    let gate = TestGate::start_with(|options| {
        options.launch.command = Some("echo 'no server here'; exit 1".to_string());
    })
    .await;
    gate.add_app("broken");

    let (status, body) = gate.get("broken.test", "/").await;
    assert_eq!(status, 500);
    assert!(body.contains("no server here") || body.contains("died"), "{}", body);
    assert!(gate.wait_for_event("broken", "shutdown", Duration::from_secs(5)).await);

    gate.stop().await;
}

// ============================================================================
// Static files
// ============================================================================

#[tokio::test]
async fn test_static_files_are_canonicalized() {
    let gate = TestGate::start().await;
    let app_dir = gate.add_app("site");
    std::fs::create_dir_all(app_dir.join("public/subfolder")).unwrap();
    std::fs::write(app_dir.join("public/index.html"), "static index").unwrap();
    std::fs::write(app_dir.join("secret.txt"), "outside public").unwrap();

    let (status, body) = gate.get("site.test", "/index.html").await;
    assert_eq!(status, 200);
    assert_eq!(body, "static index");

    let (_, traversal) = gate.get("site.test", "/subfolder/../index.html").await;
    assert_eq!(traversal, "static index");

    let (_, above_root) = gate.get("site.test", "/../index.html").await;
    assert_eq!(above_root, "static index");

    // Escaping public/ is impossible; the app answers instead
    let (_, escaped) = gate.get("site.test", "/../secret.txt").await;
    assert!(escaped.starts_with("Hello from site"), "{}", escaped);

    // The root and directories always go to the app
    let (_, root) = gate.get("site.test", "/").await;
    assert!(root.starts_with("Hello from site"), "{}", root);
    let (_, dir) = gate.get("site.test", "/subfolder").await;
    assert!(dir.starts_with("Hello from site"), "{}", dir);

    gate.stop().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_restart_txt_restarts_app() {
    let gate = TestGate::start().await;
    let app_dir = gate.add_app("hello");

    let (status, _) = gate.get("hello.test", "/").await;
    assert_eq!(status, 200);
    let first = gate.apps.get("hello").unwrap();

    // Let the restart watcher record the initial mtime
    tokio::time::sleep(Duration::from_millis(300)).await;
    bump_mtime(&app_dir.join("tmp/restart.txt"));

    assert!(gate.wait_for_event("hello", "shutdown", Duration::from_secs(10)).await);

    let events = gate.app_events("hello");
    let killing = events
        .iter()
        .position(|r| r["event"] == "killing_app")
        .unwrap();
    let shutdown = events.iter().position(|r| r["event"] == "shutdown").unwrap();
    assert!(killing < shutdown);
    assert_eq!(events[killing]["reason"], "restart.txt touched");

    let (status, body) = gate.get("hello.test", "/").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("Hello from hello"));
    let second = gate.apps.get("hello").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    gate.stop().await;
}

#[tokio::test]
async fn test_idle_app_is_stopped_and_rebooted() {
    let gate = TestGate::start_with(|options| {
        options.idle_timeout = Duration::from_millis(500);
        options.idle_check_interval = Duration::from_millis(100);
    })
    .await;
    gate.add_app("sleepy");

    let (status, _) = gate.get("sleepy.test", "/").await;
    assert_eq!(status, 200);
    let first = gate.apps.get("sleepy").unwrap();

    assert!(gate.wait_for_event("sleepy", "idle_app", Duration::from_secs(5)).await);
    assert!(gate.wait_for_event("sleepy", "shutdown", Duration::from_secs(5)).await);
    assert!(gate.apps.get("sleepy").is_none());

    let killing = gate
        .app_events("sleepy")
        .into_iter()
        .find(|r| r["event"] == "killing_app")
        .unwrap();
    assert_eq!(killing["reason"], "app is idle");

    let (status, _) = gate.get("sleepy.test", "/").await;
    assert_eq!(status, 200);
    let second = gate.apps.get("sleepy").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    gate.stop().await;
}

#[tokio::test]
async fn test_purge_stops_every_app() {
    let gate = TestGate::start().await;
    gate.add_app("one");
    gate.add_app("two");

    assert_eq!(gate.get("one.test", "/").await.0, 200);
    assert_eq!(gate.get("two.test", "/").await.0, 200);
    assert_eq!(gate.apps.len(), 2);

    gate.apps.purge().await;
    assert!(gate.apps.is_empty());

    let records = gate.apps.events().records();
    assert_eq!(records.last().unwrap()["event"], "apps_purged");
    for name in ["one", "two"] {
        assert!(gate.app_events(name).iter().any(|r| r["event"] == "shutdown"));
    }

    gate.stop().await;
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[tokio::test]
async fn test_status_and_events_endpoints() {
    let gate = TestGate::start().await;
    gate.add_app("hello");
    std::fs::write(gate.path().join("api"), "http://localhost:3000").unwrap();

    assert_eq!(gate.get("hello.test", "/").await.0, 200);
    // The pointer target is not running; resolving it is enough for /status
    gate.apps.resolve("api").await.unwrap();

    // Output is captured asynchronously
    let hello = gate.apps.get("hello").unwrap();
    let start = Instant::now();
    while !hello.log().contains("listening") && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (status, body) = gate.get("devgate", "/status").await;
    assert_eq!(status, 200);
    let statuses: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(statuses["hello"]["scheme"], "httpu");
    assert_eq!(statuses["hello"]["status"], "running");
    assert!(statuses["hello"]["address"]
        .as_str()
        .unwrap()
        .ends_with(".sock"));
    assert!(statuses["hello"]["log"]
        .as_str()
        .unwrap()
        .contains("Mock backend: hello listening"));
    assert_eq!(statuses["api"]["scheme"], "http");
    assert_eq!(statuses["api"]["address"], "localhost:3000");

    let (status, body) = gate.get("devgate", "/events").await;
    assert_eq!(status, 200);
    let events: Vec<Value> = body
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(events.iter().all(|e| e["time"].is_string()));
    assert!(events
        .iter()
        .any(|e| e["event"] == "app_ready" && e["app"] == "hello"));

    let (status, _) = gate.get("devgate", "/nothing").await;
    assert_eq!(status, 404);

    gate.stop().await;
}

// ============================================================================
// HTTPS
// ============================================================================

/// GET over TLS with SNI `host`, trusting only `ca`
async fn https_get(port: u16, host: &str, path: &str, ca: &rustls::pki_types::CertificateDer<'static>) -> (u16, String) {
    let mut roots = RootCertStore::empty();
    roots.add(ca.clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let server_name = ServerName::try_from(host.to_string()).unwrap();
    let mut stream = connector.connect(server_name, tcp).await.unwrap();

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // The server may close without close_notify; keep what arrived
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }

    let response = String::from_utf8(raw).unwrap();
    let status = response.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_https_issues_certificate_for_sni_name() {
    let support = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(support.path(), false).unwrap();
    let ca_der = ca.ca_der().clone();

    let gate = TestGate::start_tls(ca).await;
    gate.add_app("hello");

    let (status, body) = https_get(gate.port, "hello.test", "/secure", &ca_der).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body, "Hello from hello (proto=https, path=/secure)");

    // A second name gets its own leaf from the same authority
    let (status, body) = https_get(gate.port, "www.hello.test", "/", &ca_der).await;
    assert_eq!(status, 200);
    assert!(body.contains("proto=https"), "{}", body);

    gate.stop().await;
}
