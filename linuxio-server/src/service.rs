//! Top-level task orchestration: wires the session manager and HTTP
//! listener tasks together behind one [`ShutdownHandle`] so a single
//! Ctrl-C stops the whole process cleanly.

use std::sync::Arc;

use task::{spawn_task, ChildTask, ShutdownHandle, ShutdownSignal, Task as _};

use crate::auth::{CredentialVerifier, LoginRateLimiter};
use crate::config::ConfHandle;
use crate::listener::HttpListener;
use crate::session::session_manager_channel;
use crate::{AppState, LogConfig};

/// Holds every spawned background task so the service can be stopped as a
/// unit; dropping it aborts anything still running.
pub struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
}

impl Tasks {
    fn register<T>(&mut self, task: T, shutdown_signal: ShutdownSignal)
    where
        T: task::Task<Output = anyhow::Result<()>> + 'static,
    {
        self.inner.push(spawn_task(task, shutdown_signal));
    }

    pub fn stop(&self) {
        self.shutdown_handle.signal();
    }

    pub async fn join_all(self) {
        for child in self.inner {
            if let Err(error) = child.join().await {
                error!(%error, "task panicked");
            }
        }
    }
}

pub async fn spawn_tasks(conf: ConfHandle, credential_verifier: Arc<dyn CredentialVerifier>) -> anyhow::Result<Tasks> {
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let mut tasks = Tasks {
        inner: Vec::new(),
        shutdown_handle,
    };

    let (sessions, session_manager_task) = session_manager_channel();
    tasks.register(session_manager_task, shutdown_signal.clone());

    let log_deleter = bridge_log::LogDeleterTask::<LogConfig>::new(conf.get().log_file.clone());
    tasks.register(log_deleter, shutdown_signal.clone());

    let state = AppState {
        conf: conf.clone(),
        sessions,
        credential_verifier,
        login_rate_limiter: Arc::new(LoginRateLimiter::new(5, std::time::Duration::from_secs(60))),
    };

    let listener = HttpListener::bind(conf.get().port, state).await?;
    tasks.register(listener, shutdown_signal);

    Ok(tasks)
}
