//! Newline-delimited JSON RPC dispatcher.
//!
//! Each call is a single `{"type", "command", "args"}` request line
//! answered with a single `{status, output?, error?}` response line; the
//! registry is a fixed, two-level `HashMap` built once at startup, not
//! anything plugin-loaded or remotely discoverable.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

use crate::error::RpcError;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub namespace: String,
    pub command: String,
    #[serde(default, rename = "args")]
    pub argv: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(output: String) -> Self {
        Self {
            status: Status::Ok,
            output: Some(output),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            output: None,
            error: Some(message.into()),
        }
    }
}

pub type Handler = fn(&[String]) -> anyhow::Result<String>;

#[derive(Default)]
pub struct HandlerRegistry {
    namespaces: HashMap<&'static str, HashMap<&'static str, Handler>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, namespace: &'static str, command: &'static str, handler: Handler) {
        self.namespaces.entry(namespace).or_default().insert(command, handler);
    }

    fn lookup(&self, namespace: &str, command: &str) -> Option<Handler> {
        self.namespaces.get(namespace)?.get(command).copied()
    }
}

/// The `echo`/`whoami` handlers wired at startup to exercise the
/// dispatcher end-to-end; the real host-action handlers are out of scope.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    registry.register("demo", "echo", handle_echo);
    registry.register("demo", "whoami", handle_whoami);
    registry
}

fn handle_echo(argv: &[String]) -> anyhow::Result<String> {
    Ok(argv.join(" "))
}

fn handle_whoami(_argv: &[String]) -> anyhow::Result<String> {
    Ok(std::env::var("LINUXIO_USERNAME").unwrap_or_else(|_| "unknown".to_owned()))
}

fn valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reads exactly one request line from `reader`, dispatches it, and writes
/// exactly one response line to `writer`, then returns.
pub async fn serve_one_call<R, W>(reader: R, mut writer: W, registry: &HandlerRegistry) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    const MAX_LINE: usize = 64 * 1024;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;

    let response = if n == 0 {
        Response::error("connection closed before a request was sent")
    } else if line.len() > MAX_LINE {
        Response::error(RpcError::LineTooLong.to_string())
    } else {
        dispatch(line.trim_end(), registry)
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await?;

    Ok(())
}

/// Accepts connections on `listener` for the life of the process, serving
/// each with exactly one [`serve_one_call`]; unlike the main yamux socket
/// this one is listened on continuously rather than dialed once per spawn,
/// since RPC calls are many short-lived connections over time rather than
/// one long-lived multiplexed session.
pub async fn serve_rpc(listener: tokio::net::UnixListener, registry: &'static HandlerRegistry) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "failed to accept rpc connection");
                continue;
            }
        };

        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            if let Err(error) = serve_one_call(read_half, write_half, registry).await {
                warn!(%error, "rpc call failed");
            }
        });
    }
}

fn dispatch(line: &str, registry: &HandlerRegistry) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(error) => return Response::error(RpcError::MalformedJson(error).to_string()),
    };

    if !valid_identifier(&request.namespace) || !valid_identifier(&request.command) {
        return Response::error(RpcError::InvalidIdentifier(format!("{}.{}", request.namespace, request.command)).to_string());
    }

    let Some(handler) = registry.lookup(&request.namespace, &request.command) else {
        return Response::error(
            RpcError::HandlerNotFound {
                namespace: request.namespace,
                command: request.command,
            }
            .to_string(),
        );
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&request.argv))) {
        Ok(Ok(output)) => Response::ok(output),
        Ok(Err(error)) => Response::error(error.to_string()),
        Err(_) => {
            error!(namespace = %request.namespace, command = %request.command, "rpc-handler-panic");
            Response::error(RpcError::HandlerPanic.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_joined_argv() {
        let registry = default_registry();
        let request = serde_json::json!({"type": "demo", "command": "echo", "args": ["a", "b"]});
        let input = format!("{request}\n");

        let mut output = Vec::new();
        serve_one_call(input.as_bytes(), &mut output, &registry).await.unwrap();

        let response: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(response["status"], "ok");
        assert_eq!(response["output"], "a b");
    }

    #[tokio::test]
    async fn unknown_command_reports_an_error_response() {
        let registry = default_registry();
        let request = serde_json::json!({"type": "demo", "command": "nope", "args": []});
        let input = format!("{request}\n");

        let mut output = Vec::new();
        serve_one_call(input.as_bytes(), &mut output, &registry).await.unwrap();

        let response: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(response["status"], "error");
    }

    #[tokio::test]
    async fn rejects_identifiers_with_path_separators() {
        let registry = default_registry();
        let request = serde_json::json!({"type": "demo/../etc", "command": "echo", "args": []});
        let input = format!("{request}\n");

        let mut output = Vec::new();
        serve_one_call(input.as_bytes(), &mut output, &registry).await.unwrap();

        let response: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn valid_identifier_rejects_dots_and_slashes() {
        assert!(valid_identifier("demo"));
        assert!(valid_identifier("demo_2"));
        assert!(!valid_identifier("demo.x"));
        assert!(!valid_identifier("demo/x"));
        assert!(!valid_identifier(""));
    }
}
