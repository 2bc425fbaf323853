#[macro_use]
extern crate tracing;

use std::os::fd::{FromRawFd as _, RawFd};

use camino::Utf8PathBuf;
use linuxio_bridge::handshake::{self, Secret};
use linuxio_bridge::{rpc, stream, LogConfig};
use task::Task as _;
use tokio::io::AsyncReadExt as _;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::compat::TokioAsyncReadCompatExt as _;

fn main() -> anyhow::Result<()> {
    let session_id = std::env::var("LINUXIO_SESSION_ID")?;
    let username = std::env::var("LINUXIO_USERNAME")?;
    let socket_path = std::env::var("LINUXIO_BRIDGE_SOCKET")?;
    let rpc_socket_path = std::env::var("LINUXIO_RPC_SOCKET")?;
    let secret_fd: RawFd = std::env::var("LINUXIO_SECRET_FD")?.parse()?;
    let verbose = std::env::var("LINUXIO_VERBOSE").is_ok();

    let log_directive = if verbose { "debug" } else { "info" };
    let log_path = Utf8PathBuf::from(format!("/var/log/linuxio/linuxio-bridge-{session_id}.log"));
    let _logger_guard = bridge_log::init::<LogConfig>(&log_path, log_directive, None)?;

    info!(%session_id, %username, "bridge starting");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let (shutdown_handle, shutdown_signal) = task::ShutdownHandle::new();
        let _log_deleter: task::ChildTask<anyhow::Result<()>> =
            task::ChildTask::spawn(bridge_log::LogDeleterTask::<LogConfig>::new(log_path).run(shutdown_signal));

        let rpc_registry: &'static rpc::HandlerRegistry = Box::leak(Box::new(rpc::default_registry()));
        let rpc_listener = bind_rpc_socket(&rpc_socket_path).await?;
        tokio::spawn(rpc::serve_rpc(rpc_listener, rpc_registry));

        let secret = read_secret(secret_fd).await?;
        let mut stream = UnixStream::connect(&socket_path).await?;

        handshake::authenticate(&mut stream, &secret).await?;
        info!(%session_id, "handshake complete");

        let result = run_yamux_server(stream).await;
        shutdown_handle.signal();
        result
    })
}

async fn bind_rpc_socket(path: &str) -> anyhow::Result<UnixListener> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(UnixListener::bind(path)?)
}

async fn read_secret(fd: RawFd) -> anyhow::Result<Secret> {
    // SAFETY: `fd` was inherited from the parent at spawn and is exactly
    // the pipe's read end described in `LINUXIO_SECRET_FD`; nothing else
    // in this process reads from or closes it before this point.
    let owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) };
    let mut pipe = tokio::net::unix::pipe::Receiver::try_from(owned)?;

    let mut secret = [0u8; handshake::SECRET_LEN];
    pipe.read_exact(&mut secret).await?;
    Ok(secret)
}

async fn run_yamux_server(stream: UnixStream) -> anyhow::Result<()> {
    let mut conn = yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Server);

    let stream_registry = stream::default_registry();

    use futures::StreamExt as _;
    while let Some(substream) = conn.next().await {
        let substream = substream?;
        if let Err(error) = stream::dispatch_substream(substream, &stream_registry).await {
            warn!(%error, "failed to dispatch incoming substream");
        }
    }

    Ok(())
}
