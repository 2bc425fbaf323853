//! Supervises the privileged `linuxio-bridge` child process for one session:
//! spawns it (with a privilege-escalation ladder and stale-orphan cleanup),
//! hands it the handshake secret through an inherited pipe, waits for it to
//! dial back on a per-session Unix socket, and caches the resulting yamux
//! connection on the session so a second WebSocket for the same session
//! reuses it instead of spawning a second bridge.

use std::os::fd::{AsRawFd as _, FromRawFd as _};
use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::compat::TokioAsyncReadCompatExt as _;

use crate::config::ConfHandle;
use crate::handshake;
use crate::session::{SessionId, SessionRuntime};

/// A live, handshaken, cached connection to a session's bridge process.
/// Lives inside [`SessionRuntime`] so every WebSocket for the same session
/// shares one bridge and one yamux connection.
pub struct BridgeHandle {
    control: yamux::Control,
    pub privileged: bool,
    socket_path: Utf8PathBuf,
    rpc_socket_path: Utf8PathBuf,
    kill_tx: Option<oneshot::Sender<()>>,
    _driver: task::ChildTask<()>,
    reaper: task::ChildTask<()>,
}

impl BridgeHandle {
    /// Signals the reaper to kill the child, waits for it to actually exit,
    /// then removes both Unix socket files. The connection-driving task is
    /// simply aborted on drop; it has nothing left to flush once the child
    /// is gone.
    pub async fn shutdown(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        let _ = self.reaper.join().await;

        let _ = tokio::fs::remove_file(&self.socket_path).await;
        let _ = tokio::fs::remove_file(&self.rpc_socket_path).await;
    }
}

/// Returns the cached bridge connection for `session_id`, spawning one if
/// none exists yet. The runtime's bridge lock is held across the spawn, so
/// two WebSocket upgrades racing for the same fresh session serialize onto
/// one spawn instead of each starting their own bridge.
pub async fn acquire(
    conf: &ConfHandle,
    session_id: &SessionId,
    username: &str,
    runtime: &SessionRuntime,
    password: Option<String>,
) -> anyhow::Result<(yamux::Control, bool)> {
    let mut guard = runtime.bridge().await;
    if let Some(handle) = guard.as_ref() {
        return Ok((handle.control.clone(), handle.privileged));
    }

    let handle = spawn_bridge(conf, session_id, username, password).await?;
    let result = (handle.control.clone(), handle.privileged);
    *guard = Some(handle);
    Ok(result)
}

/// Which way `spawn_bridge` invokes `bridge_bin`, tried in order until one
/// produces a bridge that completes the handshake.
enum SpawnMode {
    /// `sudo -S -u <username>`, password piped on stdin then zeroed.
    PasswordPiped(String),
    /// `sudo -n -u <username>`, no password (works with a NOPASSWD rule).
    NonInteractiveSudo,
    /// Exec `bridge_bin` directly, unprivileged. Final fallback; the
    /// resulting session is never marked privileged.
    Direct,
}

impl SpawnMode {
    fn is_privileged(&self) -> bool {
        !matches!(self, SpawnMode::Direct)
    }
}

fn candidate_modes(password: Option<String>) -> Vec<SpawnMode> {
    let mut modes = Vec::new();
    if nix_is_root() {
        if let Some(password) = password {
            modes.push(SpawnMode::PasswordPiped(password));
        }
        modes.push(SpawnMode::NonInteractiveSudo);
    }
    modes.push(SpawnMode::Direct);
    modes
}

/// Spawns `linuxio-bridge` for `session_id`/`username`, walking the
/// privilege-fallback ladder until one mode's child completes the
/// handshake; cleans up any orphaned bridge left by a previous run for this
/// session first.
async fn spawn_bridge(conf: &ConfHandle, session_id: &SessionId, username: &str, password: Option<String>) -> anyhow::Result<BridgeHandle> {
    kill_stale_bridges(session_id).await;

    let socket_path = socket_path_for(session_id);
    let rpc_socket_path = rpc_socket_path_for(session_id);
    cleanup_stale_socket(&socket_path).await?;
    cleanup_stale_socket(&rpc_socket_path).await?;

    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    let mut last_error = None;
    for mode in candidate_modes(password) {
        let privileged = mode.is_privileged();
        match spawn_once(conf, session_id, username, mode, &listener, &socket_path, &rpc_socket_path).await {
            Ok((stream, child)) => {
                let mut handle = spawn_connection(stream, child, session_id.clone(), socket_path.clone(), rpc_socket_path.clone())?;
                handle.privileged = privileged;
                verify_bridge_identity(&rpc_socket_path, session_id, username);
                return Ok(handle);
            }
            Err(error) => {
                warn!(%session_id, %error, privileged, "bridge spawn attempt failed, trying next mode");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no spawn mode available")))
}

/// Spawns one child under `mode`, waits for it to dial back on `listener`,
/// and completes the handshake. Returns the connected stream and child on
/// success so the caller can wrap them in a [`BridgeHandle`].
async fn spawn_once(
    conf: &ConfHandle,
    session_id: &SessionId,
    username: &str,
    mode: SpawnMode,
    listener: &UnixListener,
    socket_path: &Utf8PathBuf,
    rpc_socket_path: &Utf8PathBuf,
) -> anyhow::Result<(UnixStream, Child)> {
    let secret = handshake::generate_secret();
    let (mut write_end, read_end) = os_pipe()?;

    let mut command = build_command(&conf.get().bridge_bin, username, &mode);
    command
        .env("LINUXIO_SESSION_ID", session_id.as_str())
        .env("LINUXIO_USERNAME", username)
        .env("LINUXIO_BRIDGE_SOCKET", socket_path.as_str())
        .env("LINUXIO_RPC_SOCKET", rpc_socket_path.as_str())
        .env("LINUXIO_SECRET_FD", "3")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let password = match mode {
        SpawnMode::PasswordPiped(password) => {
            command.stdin(Stdio::piped());
            Some(password)
        }
        SpawnMode::NonInteractiveSudo | SpawnMode::Direct => {
            command.stdin(Stdio::null());
            None
        }
    };

    // SAFETY: `read_end` is a valid, owned file descriptor created just
    // above by `os_pipe`, not yet closed, and not used anywhere else; the
    // closure runs in the forked child before exec and only duplicates it
    // onto fd 3.
    unsafe {
        command.pre_exec(move || {
            let target = 3;
            if read_end.as_raw_fd() != target {
                if libc::dup2(read_end.as_raw_fd(), target) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;

    if let Some(mut password) = password {
        let mut stdin = child.stdin.take().expect("stdin is piped for PasswordPiped mode");
        let write_result = stdin.write_all(format!("{password}\n").as_bytes()).await;
        zero_string(&mut password);
        drop(stdin);
        write_result?;
    }

    write_end.write_all(&secret).await?;
    drop(write_end);

    let accept = tokio::time::timeout(Duration::from_secs(10), listener.accept());
    let (mut stream, _addr) = match accept.await {
        Ok(Ok(pair)) => pair,
        Ok(Err(error)) => {
            let _ = child.kill().await;
            return Err(error.into());
        }
        Err(_) => {
            let _ = child.kill().await;
            anyhow::bail!("bridge for session {session_id} did not connect within the startup timeout");
        }
    };

    handshake::authenticate_server(&mut stream, &secret).await.inspect_err(|_| {
        warn!(%session_id, "bridge handshake failed, killing child");
    })?;

    Ok((stream, child))
}

/// Drives the yamux connection and the child's exit for the life of the
/// bridge, returning the pieces a [`BridgeHandle`] needs (`privileged` is
/// filled in by the caller, which already knows it from the spawn mode).
fn spawn_connection(stream: UnixStream, child: Child, session_id: SessionId, socket_path: Utf8PathBuf, rpc_socket_path: Utf8PathBuf) -> anyhow::Result<BridgeHandle> {
    let mut conn = yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Client);
    let control = conn.control();

    let driver = task::ChildTask::spawn(async move {
        while let Some(inbound) = conn.next().await {
            if inbound.is_err() {
                break;
            }
            warn!("bridge opened an unexpected substream; ignoring it");
        }
    });

    let (kill_tx, reaper) = spawn_reaper(child, session_id);

    Ok(BridgeHandle {
        control,
        privileged: false,
        socket_path,
        rpc_socket_path,
        kill_tx: Some(kill_tx),
        _driver: driver,
        reaper,
    })
}

fn spawn_reaper(mut child: Child, session_id: SessionId) -> (oneshot::Sender<()>, task::ChildTask<()>) {
    let (kill_tx, kill_rx) = oneshot::channel();

    let task = task::ChildTask::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(%session_id, %status, "bridge process exited"),
                    Err(error) => warn!(%session_id, %error, "failed to wait on bridge process"),
                }
            }
            _ = kill_rx => {
                if let Err(error) = child.kill().await {
                    warn!(%session_id, %error, "failed to kill bridge process");
                }
            }
        }
    });

    (kill_tx, task)
}

/// Dials the bridge's dedicated RPC socket once and checks its `whoami`
/// response against the username we asked it to run as. Purely a
/// diagnostic: failures are logged and never propagated, since a RPC
/// hiccup is not a reason to tear down an otherwise-working bridge.
fn verify_bridge_identity(rpc_socket_path: &Utf8PathBuf, session_id: &SessionId, username: &str) {
    let rpc_socket_path = rpc_socket_path.clone();
    let session_id = session_id.clone();
    let username = username.to_owned();

    tokio::spawn(async move {
        // The bridge binds its RPC socket before dialing the main socket, so
        // by the time we get here it should already exist; a couple of
        // retries absorb the remaining race.
        let mut stream = None;
        for _ in 0..5 {
            match UnixStream::connect(&rpc_socket_path).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
        let Some(stream) = stream else {
            debug!(%session_id, "identity verification skipped: rpc socket never appeared");
            return;
        };

        let (read_half, mut write_half) = stream.into_split();
        let request = serde_json::json!({"type": "demo", "command": "whoami", "args": []});
        if write_half.write_all(format!("{request}\n").as_bytes()).await.is_err() {
            return;
        }

        let mut line = String::new();
        if BufReader::new(read_half).read_line(&mut line).await.is_err() {
            return;
        }

        let Ok(response) = serde_json::from_str::<serde_json::Value>(&line) else {
            return;
        };
        if response["status"] == "ok" && response["output"] != username {
            warn!(%session_id, expected = %username, actual = %response["output"], "bridge identity mismatch");
        }
    });
}

fn socket_path_for(session_id: &SessionId) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/run/linuxio/bridge-{session_id}.sock"))
}

fn rpc_socket_path_for(session_id: &SessionId) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/run/linuxio/bridge-{session_id}-rpc.sock"))
}

async fn cleanup_stale_socket(path: &Utf8PathBuf) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(%path, "removed stale bridge socket");
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Scans `/proc` for a previous bridge process for this session (matched by
/// `LINUXIO_SESSION_ID` in its environment) and kills it: `SIGTERM`, a
/// 250ms grace period, then `SIGKILL` if it's still alive. A session always
/// spawns at most one live bridge; anything else still running under its
/// env marker is a leftover from a crash or a supervisor restart.
async fn kill_stale_bridges(session_id: &SessionId) {
    let Ok(mut read_dir) = tokio::fs::read_dir("/proc").await else {
        return;
    };

    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
            continue;
        };

        if process_matches(pid, session_id).await {
            warn!(%session_id, pid, "killing stale bridge orphan");
            kill_pid(pid).await;
        }
    }
}

async fn process_matches(pid: i32, session_id: &SessionId) -> bool {
    let Ok(environ) = tokio::fs::read(format!("/proc/{pid}/environ")).await else {
        return false;
    };
    let marker = format!("LINUXIO_SESSION_ID={session_id}");
    environ.split(|&b| b == 0).any(|entry| entry == marker.as_bytes())
}

async fn kill_pid(pid: i32) {
    // SAFETY: `pid` was just read from a live entry under `/proc`; sending a
    // signal to a pid that exits concurrently is a harmless no-op (ESRCH).
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    tokio::time::sleep(Duration::from_millis(250)).await;
    // SAFETY: signal 0 only probes whether `pid` still exists, per kill(2).
    let still_alive = unsafe { libc::kill(pid, 0) == 0 };
    if still_alive {
        // SAFETY: same pid as above, still just sending a signal.
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Builds the command that execs `bridge_bin` under the ladder's current
/// `mode`.
fn build_command(bridge_bin: &Utf8PathBuf, username: &str, mode: &SpawnMode) -> Command {
    match mode {
        SpawnMode::PasswordPiped(_) => {
            let mut sudo = Command::new("sudo");
            sudo.arg("-S").arg("-u").arg(username).arg(bridge_bin.as_str());
            sudo.env_clear();
            sudo
        }
        SpawnMode::NonInteractiveSudo => {
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg("-u").arg(username).arg(bridge_bin.as_str());
            sudo.env_clear();
            sudo
        }
        SpawnMode::Direct => {
            let mut direct = Command::new(bridge_bin.as_str());
            direct.env_clear();
            direct
        }
    }
}

fn nix_is_root() -> bool {
    // SAFETY: `getuid` has no preconditions; it only reads process state.
    unsafe { libc::getuid() == 0 }
}

/// Overwrites a password's bytes with zeros before it's dropped.
///
/// SAFETY: every byte written is `0`, which is valid UTF-8, so the string
/// stays a well-formed `String` for the remainder of its (immediately
/// ending) lifetime.
fn zero_string(s: &mut String) {
    unsafe {
        for byte in s.as_mut_vec() {
            *byte = 0;
        }
    }
}

/// A pipe whose read end is inherited by the child and whose write end the
/// parent uses to push the handshake secret across before exec completes.
struct PipeWriteEnd(tokio::net::unix::pipe::Sender);

impl PipeWriteEnd {
    async fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt as _;
        self.0.write_all(buf).await?;
        Ok(())
    }
}

struct PipeReadEnd(std::os::fd::OwnedFd);

impl AsRawFd for PipeReadEnd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

fn os_pipe() -> anyhow::Result<(PipeWriteEnd, PipeReadEnd)> {
    let mut fds = [0i32; 2];
    // SAFETY: `fds` is a valid, correctly-sized out-parameter for `pipe`.
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if res != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let read_fd = fds[0];
    let write_fd = fds[1];

    // SAFETY: `write_fd` was just returned by `pipe` above and not yet
    // owned by anything else.
    let write_owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(write_fd) };
    let sender = tokio::net::unix::pipe::Sender::try_from(write_owned)?;

    // SAFETY: `read_fd` was just returned by `pipe` above and not yet
    // owned by anything else.
    let read_owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(read_fd) };

    Ok((PipeWriteEnd(sender), PipeReadEnd(read_owned)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_is_namespaced_per_session() {
        let id: SessionId = "abc123".parse().unwrap();
        let path = socket_path_for(&id);
        assert!(path.as_str().contains("abc123"));
        assert!(path.as_str().starts_with("/run/linuxio/"));
    }

    #[test]
    fn rpc_socket_path_is_distinct_from_the_main_socket() {
        let id: SessionId = "abc123".parse().unwrap();
        assert_ne!(socket_path_for(&id), rpc_socket_path_for(&id));
    }

    #[tokio::test]
    async fn cleanup_is_a_noop_when_nothing_stale_exists() {
        let path = Utf8PathBuf::from("/tmp/linuxio-test-no-such-socket-xyz.sock");
        cleanup_stale_socket(&path).await.unwrap();
    }

    #[test]
    fn zero_string_clears_every_byte() {
        let mut password = "hunter2".to_owned();
        zero_string(&mut password);
        assert!(password.bytes().all(|b| b == 0));
    }

    #[test]
    fn direct_mode_is_never_privileged() {
        assert!(!SpawnMode::Direct.is_privileged());
        assert!(SpawnMode::NonInteractiveSudo.is_privileged());
        assert!(SpawnMode::PasswordPiped("x".to_owned()).is_privileged());
    }
}
