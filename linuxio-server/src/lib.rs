//! Unprivileged web server half of the host-management service: owns the
//! session store, terminates TLS-free plain HTTP, authenticates logins,
//! supervises one privileged `linuxio-bridge` child per session, and
//! relays `StreamFrame`s between the browser's WebSocket and that child's
//! yamux connection.

#[macro_use]
extern crate tracing;

use std::sync::Arc;

use crate::auth::{CredentialVerifier, LoginRateLimiter};
use crate::config::ConfHandle;
use crate::session::SessionManagerHandle;

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handshake;
pub mod http;
pub mod listener;
pub mod relay;
pub mod router;
pub mod service;
pub mod session;
pub mod ws;

/// State shared by every HTTP handler, cloned cheaply per-request (every
/// field is an `Arc` or a handle to a background task).
#[derive(Clone)]
pub struct AppState {
    pub conf: ConfHandle,
    pub sessions: SessionManagerHandle,
    pub credential_verifier: Arc<dyn CredentialVerifier>,
    pub login_rate_limiter: Arc<LoginRateLimiter>,
}

/// Log-rotation parameters for this binary; shared between `main.rs` (which
/// initializes the logger) and the `LogDeleterTask` registered in `service.rs`.
pub struct LogConfig;

impl bridge_log::StaticLogConfig for LogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "linuxio-server";
}
