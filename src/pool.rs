//! Connection pool for app connections
//!
//! One pooled hyper client reaches every app: launched apps over their unix
//! socket, proxy pointers over TCP or TLS. Unix socket paths travel in the
//! request URI as a hex-encoded authority (`unix://<hex path>/...`) so the
//! pool keys idle connections per socket.

use crate::process::Scheme;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::future::Future;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Body type sent upstream
pub type UpstreamBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => {
                write!(f, "{}", e)?;
                let mut source = std::error::Error::source(e);
                while let Some(inner) = source {
                    write!(f, ": {}", inner)?;
                    source = inner.source();
                }
                Ok(())
            }
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Number of times idle connections were dropped
    pub resets: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per app
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled client for every app, reset whenever an app goes away
pub struct ConnectionPool {
    client: RwLock<Client<BackendConnector, UpstreamBody>>,
    connector: BackendConnector,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let connector = BackendConnector::new();
        let client = build_client(&config, connector.clone());

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client: RwLock::new(client),
            connector,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Drop every idle connection. Requests in flight keep their connection.
    pub fn close_idle_connections(&self) {
        let fresh = build_client(&self.config, self.connector.clone());
        *self.client.write() = fresh;
        self.stats.record_reset();
        debug!("Idle app connections dropped");
    }

    /// Send a request to the app reachable at `scheme`/`host`/`port`
    pub async fn send_to<B>(
        &self,
        req: Request<B>,
        scheme: Scheme,
        host: &str,
        port: u16,
    ) -> Result<Response<Incoming>, PoolError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = backend_uri(scheme, host, port, path)?;

        let (mut parts, body) = req.into_parts();

        // HTTP/2 clients put the host in the URI only
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = authority.as_str().parse() {
                    parts.headers.insert(HOST, value);
                }
            }
        }
        parts.uri = uri;
        parts.version = Version::HTTP_11;

        let backend_req = Request::from_parts(parts, body.boxed_unsync());

        self.stats.record_request();

        // Clone out of the lock so a reset never waits on a request
        let client = self.client.read().clone();
        Ok(client.request(backend_req).await?)
    }
}

fn build_client(config: &PoolConfig, connector: BackendConnector) -> Client<BackendConnector, UpstreamBody> {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .build(connector)
}

/// URI under which the client reaches an app
pub fn backend_uri(scheme: Scheme, host: &str, port: u16, path: &str) -> Result<Uri, PoolError> {
    let uri = match scheme {
        Scheme::Unix => format!("unix://{}{}", hex::encode(host.as_bytes()), path),
        Scheme::Http => format!("http://{}:{}{}", host, port, path),
        Scheme::Https => format!("https://{}:{}{}", host, port, path),
    };
    uri.parse::<Uri>()
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

/// Socket path carried by a `unix://` URI
fn socket_path(uri: &Uri) -> io::Result<PathBuf> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing socket path"))?;
    let bytes = hex::decode(host).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    Ok(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
}

/// Dials whatever an app URI names: a unix socket, TCP, or TLS over TCP
#[derive(Clone)]
pub struct BackendConnector {
    tls: TlsConnector,
}

impl Default for BackendConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendConnector {
    pub fn new() -> Self {
        Self {
            tls: TlsConnector::from(Arc::new(insecure_client_config())),
        }
    }

    async fn connect(self, uri: Uri) -> io::Result<BackendStream> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, msg.to_string());

        match uri.scheme_str() {
            Some("unix") => {
                let path = socket_path(&uri)?;
                Ok(BackendStream::Unix(UnixStream::connect(path).await?))
            }
            Some(scheme @ ("http" | "https")) => {
                let host = uri
                    .host()
                    .ok_or_else(|| invalid("missing host"))?
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_string();
                let port = uri
                    .port_u16()
                    .unwrap_or(if scheme == "https" { 443 } else { 80 });

                let tcp = TcpStream::connect((host.as_str(), port)).await?;
                tcp.set_nodelay(true)?;

                if scheme == "http" {
                    return Ok(BackendStream::Tcp(tcp));
                }

                let server_name = ServerName::try_from(host)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls = self.tls.connect(server_name, tcp).await?;
                Ok(BackendStream::Tls(Box::new(tls)))
            }
            _ => Err(invalid("unsupported scheme")),
        }
    }
}

impl tower::Service<Uri> for BackendConnector {
    type Response = TokioIo<BackendStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move { connector.connect(uri).await.map(TokioIo::new) })
    }
}

/// An open connection to an app
pub enum BackendStream {
    Unix(UnixStream),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection for BackendStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS client settings for proxy pointers. Local dev servers use self-signed
/// certificates, so the peer certificate is not verified.
fn insecure_client_config() -> ClientConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
