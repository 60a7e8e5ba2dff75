//! Front door: routes each request to the admin endpoints, a static file
//! or the app named by its Host header

use crate::admin::handle_admin_request;
use crate::apps::AppPool;
use crate::config::ServerConfig;
use crate::error::{error_response, BoxError, ErrorCode, ResponseBody};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::App;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{
    HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, RANGE,
};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Wildcard DNS services that embed an IPv4 address before a two-label suffix
const WILDCARD_IP_SUFFIXES: [&str; 2] = [".xip.io", ".nip.io"];

/// HTTP date format used for `Last-Modified`
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

type ProxyBody = ResponseBody;

/// Decides what answers a request: the admin endpoints, a static file, or an
/// app behind the connection pool.
pub struct Router {
    apps: Arc<AppPool>,
    pool: Arc<ConnectionPool>,
    domains: Vec<String>,
    admin_host: String,
    ignored_static_paths: Vec<String>,
    debug: bool,
}

impl Router {
    pub fn new(apps: Arc<AppPool>, server: &ServerConfig) -> Arc<Self> {
        Self::with_pool_config(apps, server, PoolConfig::default())
    }

    pub fn with_pool_config(apps: Arc<AppPool>, server: &ServerConfig, pool_config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(pool_config));

        // Connections to a closed app must not be reused by its successor
        let hook_pool = Arc::clone(&pool);
        apps.set_app_closed(move |app| {
            debug!(app = app.name(), "App closed, dropping idle connections");
            hook_pool.close_idle_connections();
        });

        let mut domains = server.domains.clone();
        crate::config::sort_domains(&mut domains);

        Arc::new(Self {
            apps,
            pool,
            domains,
            admin_host: server.admin_host.to_lowercase(),
            ignored_static_paths: server.ignored_static_paths.clone(),
            debug: server.debug,
        })
    }

    pub fn apps(&self) -> &Arc<AppPool> {
        &self.apps
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// App name addressed by a Host header value
    pub fn remove_tld(&self, host: &str) -> String {
        remove_tld(host, &self.domains)
    }

    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr, is_tls: bool) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let host = request_host(&req).unwrap_or_default();

        if self.debug {
            info!(method = %req.method(), host, path = req.uri().path(), "Request");
        } else {
            debug!(method = %req.method(), host, path = req.uri().path(), "Request");
        }

        if strip_port(&host).eq_ignore_ascii_case(&self.admin_host) {
            return handle_admin_request(&req, &self.apps);
        }

        let name = self.remove_tld(&host);
        let app = match self.apps.find_app_by_domain_name(&name).await {
            Ok(app) => app,
            Err(e) => {
                let events = self.apps.events();
                if e.is_unknown_app() {
                    events.add("unknown_app", &[("name", json!(name)), ("host", json!(host))]);
                    return error_response(ErrorCode::UnknownApp, e.to_string());
                }
                events.add("lookup_error", &[("error", json!(e.to_string()))]);
                return error_response(ErrorCode::LookupFailed, e.to_string());
            }
        };

        if let Err(e) = app.wait_until_ready().await {
            warn!(app = app.name(), error = %e, "App unavailable");
            return error_response(ErrorCode::AppUnavailable, e.to_string());
        }

        if let Some(response) = self.serve_static(&req, &app).await {
            return response;
        }

        self.forward(req, &app, client_addr, is_tls).await
    }

    /// Serve a file from the app's public/ directory when one matches
    async fn serve_static<B>(&self, req: &Request<B>, app: &App) -> Option<Response<ProxyBody>> {
        if !app.is_public() {
            return None;
        }

        let path = clean_path(req.uri().path());
        if path == "/" || self.ignored_static_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return None;
        }

        let file = app.dir().join("public").join(path.trim_start_matches('/'));
        let meta = tokio::fs::metadata(&file).await.ok()?;
        if meta.is_dir() {
            return None;
        }

        match static_response(req, &file, &meta).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(app = app.name(), path = %file.display(), error = %e, "Failed to serve static file");
                None
            }
        }
    }

    async fn forward<B>(
        &self,
        mut req: Request<B>,
        app: &Arc<App>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Overwrite rather than append: this is the first hop
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        let client_upgrade = if is_upgrade_request(&req) {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let mut response = match self
            .pool
            .send_to(req, app.scheme(), app.host(), app.port())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(app = app.name(), request_id, error = %e, "Failed to forward request");
                return error_response(ErrorCode::ConnectionFailed, e.to_string());
            }
        };

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let app_upgrade = hyper::upgrade::on(&mut response);
                let name = app.name().to_string();
                tokio::spawn(tunnel(client_upgrade, app_upgrade, name, request_id));
            }
        }

        response.map(|body| body.map_err(BoxError::from).boxed())
    }
}

/// Build the response for a static file, honouring `If-Modified-Since` and a
/// single byte `Range`. The body streams from disk.
async fn static_response<B>(req: &Request<B>, file: &Path, meta: &std::fs::Metadata) -> std::io::Result<Response<ProxyBody>> {
    let modified = meta.modified().ok().map(DateTime::<Utc>::from);

    if let (Some(modified), Some(since)) = (modified, if_modified_since(req)) {
        if modified.timestamp() <= since.timestamp() {
            return Ok(Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .body(empty())
                .expect("valid response with StatusCode enum"));
        }
    }

    let len = meta.len();
    let mime = mime_guess::from_path(file).first_or_octet_stream();
    let mut builder = Response::builder()
        .header(CONTENT_TYPE, mime.as_ref())
        .header(ACCEPT_RANGES, "bytes");
    if let Some(modified) = modified {
        builder = builder.header(LAST_MODIFIED, modified.format(HTTP_DATE_FORMAT).to_string());
    }

    let (start, count) = match byte_range(req, len) {
        ByteRange::Whole => {
            builder = builder.status(StatusCode::OK);
            (0, len)
        }
        ByteRange::Partial { start, end } => {
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len));
            (start, end - start + 1)
        }
        ByteRange::Unsatisfiable => {
            return Ok(builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{}", len))
                .header(CONTENT_LENGTH, 0)
                .body(empty())
                .expect("valid response with StatusCode enum and static headers"));
        }
    };
    builder = builder.header(CONTENT_LENGTH, count);

    let body = if req.method() == Method::HEAD {
        empty()
    } else {
        let mut handle = tokio::fs::File::open(file).await?;
        if start > 0 {
            handle.seek(SeekFrom::Start(start)).await?;
        }
        let stream = ReaderStream::new(handle.take(count))
            .map_ok(Frame::data)
            .map_err(BoxError::from);
        StreamBody::new(stream).boxed()
    };

    Ok(builder
        .body(body)
        .expect("valid response with StatusCode enum and static headers"))
}

/// Byte range selected by a request's `Range` header
#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Whole,
    /// Inclusive bounds within the file
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse `Range: bytes=...`. Malformed headers and multi-range requests get
/// the whole file.
fn byte_range<B>(req: &Request<B>, len: u64) -> ByteRange {
    let Some(ranges) = req
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
    else {
        return ByteRange::Whole;
    };
    if ranges.contains(',') {
        return ByteRange::Whole;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return ByteRange::Whole;
    };
    let (first, last) = (first.trim(), last.trim());

    // bytes=-N is the last N bytes
    if first.is_empty() {
        return match last.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if len == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial {
                start: len - n.min(len),
                end: len - 1,
            },
            Err(_) => ByteRange::Whole,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Whole;
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    let end = if last.is_empty() {
        len - 1
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end.min(len - 1),
            _ => return ByteRange::Whole,
        }
    };
    ByteRange::Partial { start, end }
}

fn if_modified_since<B>(req: &Request<B>) -> Option<DateTime<Utc>> {
    let value = req.headers().get(IF_MODIFIED_SINCE)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Copy bytes both ways once client and app have switched protocols
async fn tunnel(client: OnUpgrade, app: OnUpgrade, name: String, request_id: String) {
    let (client, app) = match tokio::try_join!(client, app) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            error!(app = name, request_id, error = %e, "Failed to upgrade connection");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut app_io = TokioIo::new(app);
    match tokio::io::copy_bidirectional(&mut client_io, &mut app_io).await {
        Ok((client_to_app, app_to_client)) => {
            debug!(app = name, request_id, client_to_app, app_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(app = name, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Check if a request asks to switch protocols (WebSocket and friends)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Host the client addressed, including any port. HTTP/2 clients only send
/// the URI authority.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .map(|h| h.to_lowercase())
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Map a Host header value to an app name.
///
/// `domains` must be sorted most specific first (see
/// [`crate::config::sort_domains`]).
pub fn remove_tld(host: &str, domains: &[String]) -> String {
    let host = strip_port(host);

    if WILDCARD_IP_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 6 {
            return String::new();
        }
        return labels[..labels.len() - 6].join(".");
    }

    for domain in domains {
        if let Some(name) = host.strip_suffix(domain.as_str()).and_then(|h| h.strip_suffix('.')) {
            return name.to_string();
        }
    }

    match host.rfind('.') {
        Some(dot) => host[..dot].to_string(),
        None => host.to_string(),
    }
}

/// Decode and lexically clean a request path, rooted at `/`. `..` never
/// climbs above the root.
pub fn clean_path(path: &str) -> String {
    let decoded = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());

    let mut parts: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    format!("/{}", parts.join("/"))
}

/// A front-door listener: plain HTTP, or HTTPS when given a TLS acceptor
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, router: Arc<Router>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, router, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, router, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, protocol, "Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, router: Arc<Router>, is_tls: bool) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(router.handle(req, addr, is_tls).await) }
    });

    // HTTP/1.1 connections can still be upgraded (WebSockets)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
