//! devgate - a local development front door
//!
//! Requests for `<name>.<domain>` are routed to the app named `<name>` in the
//! apps directory:
//! - directories are launched on demand on a private unix socket and stopped
//!   again once idle or when `tmp/restart.txt` is touched
//! - plain files point at an already running server (a port or a URL)
//! - public/ files are served directly without waking the app
//! - HTTPS is terminated with leaf certificates issued on the fly by a local CA

pub mod admin;
pub mod apps;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod linebuffer;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod tls;
pub mod watch;
