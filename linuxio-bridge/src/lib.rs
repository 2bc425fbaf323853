//! Privileged per-session child process: dials back to the socket its
//! supervisor bound, completes the shared-secret handshake, then serves a
//! yamux connection whose substreams are dispatched by stream type.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod handshake;
pub mod rpc;
pub mod stream;

/// Log-rotation parameters for this binary; shared between `main.rs` (which
/// initializes the logger) and the `LogDeleterTask` it registers.
pub struct LogConfig;

impl bridge_log::StaticLogConfig for LogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "linuxio-bridge";
}
