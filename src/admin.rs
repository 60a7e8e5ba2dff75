//! Built-in endpoints served on the administrative host

use crate::apps::AppPool;
use crate::error::{error_response, ErrorCode, ResponseBody};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Version information for the front door
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a plain-text response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// One entry of the `/status` document
#[derive(Debug, Serialize)]
pub struct AppSummary {
    pub scheme: &'static str,
    pub address: String,
    pub status: &'static str,
    pub log: String,
}

/// Snapshot of every registered app keyed by canonical name
pub fn status(apps: &AppPool) -> BTreeMap<String, AppSummary> {
    let mut statuses = BTreeMap::new();
    apps.for_apps(|app| {
        statuses.insert(
            app.name().to_string(),
            AppSummary {
                scheme: app.scheme().as_str(),
                address: app.address(),
                status: app.status().as_str(),
                log: app.log(),
            },
        );
    });
    statuses
}

/// Serve `/status` and `/events`; everything else is a 404
pub fn handle_admin_request<B>(req: &Request<B>, apps: &AppPool) -> Response<ResponseBody> {
    let method = req.method();
    let path = req.uri().path();

    debug!(method = %method, path, "Admin request");

    match (method, path) {
        (&Method::GET, "/status") => match serde_json::to_string(&status(apps)) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!(error = %e, "Failed to serialize status");
                error_response(ErrorCode::InternalError, e.to_string())
            }
        },
        (&Method::GET, "/events") => response(StatusCode::OK, apps.events().contents()),
        _ => error_response(ErrorCode::NotFound, "not found"),
    }
}
