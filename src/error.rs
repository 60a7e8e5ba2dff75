//! Error types and plain-text error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error carried by response bodies (upstream or file streams)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the front door writes
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Errors produced while resolving, booting or running an app.
///
/// Cloneable so the termination cause of an app can be handed to every
/// request waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// No directory, file or alias matches the requested name
    #[error("unknown app")]
    UnknownApp,
    /// The app was told to stop before it ever accepted a connection
    #[error("app died before booting")]
    DiedBeforeBoot,
    /// The app never accepted a connection within the boot timeout
    #[error("app did not boot within {timeout:?}")]
    BootTimeout { timeout: Duration },
    /// The app's output closed without anyone asking it to stop
    #[error("unexpected exit:\n\t{last_line}")]
    UnexpectedExit { last_line: String },
    /// The app was stopped on purpose (idle, restart, purge)
    #[error("app was stopped: {reason}")]
    Killed { reason: String },
    /// A proxy pointer file could not be understood
    #[error("invalid proxy target '{target}': {message}")]
    InvalidProxy { target: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl AppError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_unknown_app(&self) -> bool {
        matches!(self, AppError::UnknownApp)
    }
}

/// Errors from the certificate authority and the leaf certificate cache
#[derive(Debug, Error)]
pub enum CertError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("invalid PEM in {path}: {message}")]
    Pem { path: String, message: String },
    #[error("unusable signing key: {0}")]
    SigningKey(String),
}

impl CertError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CertError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Error codes reported in the X-Devgate-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No app matches the request's host
    UnknownApp,
    /// Lookup failed for another reason (permissions, bad pointer file, ...)
    LookupFailed,
    /// The app failed to boot or stopped while the request waited
    AppUnavailable,
    /// The app accepted the request but the upstream exchange failed
    ConnectionFailed,
    /// Unknown path on the administrative host
    NotFound,
    /// Internal proxy error
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::UnknownApp => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::LookupFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::AppUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::UnknownApp => "UNKNOWN_APP",
            ErrorCode::LookupFailed => "LOOKUP_FAILED",
            ErrorCode::AppUnavailable => "APP_UNAVAILABLE",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Plain-text error response whose body is the error message
pub fn error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Devgate-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
