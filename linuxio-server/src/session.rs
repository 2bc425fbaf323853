//! Session store: a single-writer actor task reachable through a cloneable
//! handle, the same shape the rest of this codebase uses for any piece of
//! shared mutable state that several connection handlers need to touch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore as _;
use task::{ShutdownSignal, Task};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::bridge::BridgeHandle;

/// Opaque, unguessable session identifier. Doubles as the value stored in
/// the `linuxio_session` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

use core::fmt;

/// Cross-cutting, mutable state for one session that lives outside the
/// session map itself: the cached bridge connection and the set of
/// WebSockets currently relaying through it. Shared via `Arc` so the
/// sweeper can tear it down without needing a reply from the handler
/// tasks that are actually using it.
#[derive(Default)]
pub struct SessionRuntime {
    bridge: Mutex<Option<BridgeHandle>>,
    websockets: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl SessionRuntime {
    pub async fn bridge(&self) -> tokio::sync::MutexGuard<'_, Option<BridgeHandle>> {
        self.bridge.lock().await
    }

    /// Registers a close-signal channel for a WebSocket relaying through
    /// this session; the channel is signalled once if the session expires
    /// or is deleted while the WebSocket is still open.
    pub async fn register_websocket(&self, close_tx: mpsc::UnboundedSender<()>) {
        self.websockets.lock().await.push(close_tx);
    }

    /// Closes every WebSocket bound to this session with code 1008 and
    /// drops the cached bridge connection, reaping its subprocess and
    /// removing its socket file.
    pub async fn teardown(&self) {
        for close_tx in self.websockets.lock().await.drain(..) {
            let _ = close_tx.send(());
        }
        if let Some(handle) = self.bridge.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

/// What the session store knows about one logged-in user.
#[derive(Clone)]
pub struct Session {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub expires_at: Instant,
    ttl: Duration,
    /// Flips to `true` once the bridge supervisor has successfully spawned
    /// a privileged (non-demoted) bridge for this session.
    pub privileged: bool,
    pub runtime: Arc<SessionRuntime>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("privileged", &self.privileged)
            .finish_non_exhaustive()
    }
}

enum Command {
    Create {
        username: String,
        uid: u32,
        gid: u32,
        ttl: Duration,
        reply: oneshot::Sender<SessionId>,
    },
    Get {
        id: SessionId,
        reply: oneshot::Sender<Option<Session>>,
    },
    Touch {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    SetPrivileged {
        id: SessionId,
        privileged: bool,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        id: SessionId,
        reply: oneshot::Sender<Option<Session>>,
    },
}

/// Cloneable front for the session store task.
#[derive(Clone)]
pub struct SessionManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionManagerHandle {
    pub async fn create(&self, username: String, uid: u32, gid: u32, ttl: Duration) -> SessionId {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Create {
                username,
                uid,
                gid,
                ttl,
                reply,
            })
            .await;
        rx.await.expect("session manager task is alive for the process lifetime")
    }

    /// Returns `None` both when the session never existed and when it has
    /// passed its `expires_at` deadline, even if the sweeper hasn't run yet.
    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Get { id: id.clone(), reply }).await;
        rx.await.ok().flatten()
    }

    /// Refreshes `last_seen` and slides `expires_at` forward by the
    /// session's TTL; returns `false` if the session no longer exists.
    pub async fn touch(&self, id: &SessionId) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Touch { id: id.clone(), reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn set_privileged(&self, id: &SessionId, privileged: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::SetPrivileged {
                id: id.clone(),
                privileged,
                reply,
            })
            .await;
        rx.await.unwrap_or(false)
    }

    pub async fn delete(&self, id: &SessionId) -> Option<Session> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Delete { id: id.clone(), reply }).await;
        rx.await.ok().flatten()
    }
}

/// Owns the session map; every mutation flows through this task so there is
/// never a lock to contend on from handler code.
pub struct SessionManagerTask {
    rx: mpsc::Receiver<Command>,
}

pub fn session_manager_channel() -> (SessionManagerHandle, SessionManagerTask) {
    let (tx, rx) = mpsc::channel(128);
    (SessionManagerHandle { tx }, SessionManagerTask { rx })
}

#[async_trait]
impl Task for SessionManagerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session manager";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut sessions: HashMap<SessionId, Session> = HashMap::new();
        let mut sweep = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    handle_command(&mut sessions, cmd);
                }
                _ = sweep.tick() => {
                    sweep_expired(&mut sessions);
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Hands the session's teardown (close bound WebSockets with 1008, reap
/// the cached bridge connection and its subprocess) off to its own task so
/// the single-writer loop above never blocks on it.
fn spawn_teardown(id: SessionId, runtime: Arc<SessionRuntime>) {
    tokio::spawn(async move {
        debug!(%id, "tearing down session");
        runtime.teardown().await;
    });
}

fn handle_command(sessions: &mut HashMap<SessionId, Session>, cmd: Command) {
    match cmd {
        Command::Create {
            username,
            uid,
            gid,
            ttl,
            reply,
        } => {
            let id = SessionId::generate();
            let now = Instant::now();
            sessions.insert(
                id.clone(),
                Session {
                    username,
                    uid,
                    gid,
                    created_at: now,
                    last_seen: now,
                    expires_at: now + ttl,
                    ttl,
                    privileged: false,
                    runtime: Arc::new(SessionRuntime::default()),
                },
            );
            info!(%id, "session created");
            let _ = reply.send(id);
        }
        Command::Get { id, reply } => {
            let now = Instant::now();
            let expired = sessions.get(&id).is_some_and(|session| now >= session.expires_at);
            if expired {
                if let Some(session) = sessions.remove(&id) {
                    debug!(%id, "session expired, reclaiming on Get");
                    spawn_teardown(id, session.runtime);
                }
                let _ = reply.send(None);
            } else {
                let _ = reply.send(sessions.get(&id).cloned());
            }
        }
        Command::Touch { id, reply } => {
            let found = if let Some(session) = sessions.get_mut(&id) {
                let now = Instant::now();
                session.last_seen = now;
                session.expires_at = now + session.ttl;
                true
            } else {
                false
            };
            let _ = reply.send(found);
        }
        Command::SetPrivileged { id, privileged, reply } => {
            let found = if let Some(session) = sessions.get_mut(&id) {
                session.privileged = privileged;
                true
            } else {
                false
            };
            let _ = reply.send(found);
        }
        Command::Delete { id, reply } => {
            if let Some(session) = sessions.remove(&id) {
                info!(%id, "session deleted");
                spawn_teardown(id, Arc::clone(&session.runtime));
                let _ = reply.send(Some(session));
            } else {
                let _ = reply.send(None);
            }
        }
    }
}

fn sweep_expired(sessions: &mut HashMap<SessionId, Session>) {
    let now = Instant::now();
    let expired: Vec<SessionId> = sessions
        .iter()
        .filter(|(_, session)| now >= session.expires_at)
        .map(|(id, _)| id.clone())
        .collect();

    for id in &expired {
        if let Some(session) = sessions.remove(id) {
            spawn_teardown(id.clone(), session.runtime);
        }
    }

    if !expired.is_empty() {
        debug!(reclaimed = expired.len(), "swept expired sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (handle, task) = session_manager_channel();
        let (_shutdown_handle, shutdown_signal) = task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        let id = handle.create("alice".to_owned(), 1000, 1000, Duration::from_secs(600)).await;
        let session = handle.get(&id).await.expect("session exists");
        assert_eq!(session.username, "alice");
        assert!(!session.privileged);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let (handle, task) = session_manager_channel();
        let (_shutdown_handle, shutdown_signal) = task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        let id = handle.create("bob".to_owned(), 1000, 1000, Duration::from_secs(600)).await;
        assert!(handle.delete(&id).await.is_some());
        assert!(handle.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn touch_returns_false_for_unknown_session() {
        let (handle, task) = session_manager_channel();
        let (_shutdown_handle, shutdown_signal) = task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        let bogus: SessionId = "does-not-exist".parse().unwrap();
        assert!(!handle.touch(&bogus).await);
    }

    #[tokio::test]
    async fn get_reports_not_found_strictly_after_expiry() {
        let (handle, task) = session_manager_channel();
        let (_shutdown_handle, shutdown_signal) = task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        let id = handle.create("carol".to_owned(), 1000, 1000, Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(handle.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn set_privileged_flips_the_flag() {
        let (handle, task) = session_manager_channel();
        let (_shutdown_handle, shutdown_signal) = task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        let id = handle.create("dave".to_owned(), 1000, 1000, Duration::from_secs(600)).await;
        assert!(handle.set_privileged(&id, true).await);
        assert!(handle.get(&id).await.unwrap().privileged);
    }
}
