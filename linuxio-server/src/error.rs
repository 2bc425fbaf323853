//! Typed domain errors for the pieces of this crate that need to branch on
//! *which* thing failed; `anyhow::Result` with `.context(...)` still
//! carries everything else across task and `main` boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge for session {session_id} did not connect within the startup timeout")]
    StartupTimeout { session_id: String },
    #[error("bridge handshake failed")]
    HandshakeFailed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
