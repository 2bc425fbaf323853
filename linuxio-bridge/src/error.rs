//! Typed domain errors. `anyhow` carries ad hoc failures across task and
//! `main` boundaries; these enums are for the spots that need to branch on
//! *which* thing went wrong.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("malformed JSON request: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("request line exceeds the maximum size")]
    LineTooLong,
    #[error("invalid identifier `{0}`: must be alphanumeric/underscore only")]
    InvalidIdentifier(String),
    #[error("no handler registered for {namespace}.{command}")]
    HandlerNotFound { namespace: String, command: String },
    #[error("handler panicked")]
    HandlerPanic,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Codec(#[from] stream_proto::Error),
    #[error("unknown stream type `{0}`")]
    UnknownType(String),
    #[error("stream open payload missing required argument")]
    MissingArgument,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
