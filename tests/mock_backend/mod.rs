//! Mock app for integration testing
//!
//! The integration test binary re-runs itself as the app process (see
//! `mock_backend_main` in `integration.rs`). Environment variables:
//! - SOCKET: Unix socket to listen on
//! - APP_NAME: Name echoed back in every response
//! - STARTUP_DELAY_MS: Delay before accepting connections (default: 0)

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::env;
use std::time::Duration;
use tokio::net::UnixListener;

/// Serve until the process is killed
pub async fn serve(socket: String, name: String) {
    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("Mock backend: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let _ = std::fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket).expect("Failed to bind");

    eprintln!("Mock backend: {} listening on {}", name, socket);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let name = name.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| respond(req, name.clone()));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        eprintln!("Mock backend: connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                eprintln!("Mock backend: accept error: {}", e);
            }
        }
    }
}

async fn respond(req: Request<Incoming>, name: String) -> Result<Response<Full<Bytes>>, Infallible> {
    let proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none");

    println!("Mock backend: {} {}", req.method(), req.uri().path());

    let body = format!("Hello from {} (proto={}, path={})", name, proto, req.uri().path());
    Ok(Response::new(Full::new(Bytes::from(body))))
}
