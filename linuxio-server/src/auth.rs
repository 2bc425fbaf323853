//! Login/logout handlers and the pluggable credential verifier behind them.
//!
//! Authentication is cookie-based: a successful login gets an opaque,
//! random session id in an `HttpOnly`/`SameSite=Strict` cookie. There is no
//! bearer-token mode; nothing about this service is meant to be called by
//! anything other than the browser that just logged in.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;

use crate::http::HttpError;
use crate::{bridge, AppState};

pub const SESSION_COOKIE_NAME: &str = "linuxio_session";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Verifies a username/password pair against the host's local accounts.
///
/// Conceptually PAM: a real deployment authenticates through the system's
/// configured PAM stack, so a user's login here is the same login they'd
/// use at a console or over SSH.
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, username: &str, password: &str) -> anyhow::Result<bool>;
}

#[cfg(unix)]
pub struct PamVerifier {
    pub service: String,
}

#[cfg(unix)]
impl CredentialVerifier for PamVerifier {
    fn verify(&self, username: &str, password: &str) -> anyhow::Result<bool> {
        use pam_client::{Context, Flag};

        let mut context = Context::new(&self.service, Some(username), pam_client::conv_mock::Conversation::with_credentials(username, password))?;
        match context.authenticate(Flag::NONE) {
            Ok(()) => {}
            Err(_) => return Ok(false),
        }
        match context.acct_mgmt(Flag::NONE) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// Fixed username/password, used by integration tests and demo deployments
/// that have no interest in wiring up real PAM accounts.
pub struct StaticVerifier {
    pub username: String,
    pub password: String,
}

impl CredentialVerifier for StaticVerifier {
    fn verify(&self, username: &str, password: &str) -> anyhow::Result<bool> {
        Ok(username == self.username && password == self.password)
    }
}

/// Throttles repeated login attempts per source username, independent of
/// whether they succeed, so a scripted credential-stuffing attempt can't
/// burn through guesses at network speed.
pub struct LoginRateLimiter {
    window: Duration,
    max_attempts: usize,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            window,
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the caller is allowed to attempt a login right
    /// now, recording this attempt either way.
    pub fn check(&self, username: &str) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("lock poisoned");
        let entry = attempts.entry(username.to_owned()).or_default();
        entry.retain(|attempt_at| now.duration_since(*attempt_at) < self.window);

        if entry.len() >= self.max_attempts {
            return false;
        }

        entry.push(now);
        true
    }
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<serde_json::Value>), HttpError> {
    if !state.login_rate_limiter.check(&request.username) {
        return Err(HttpError::too_many_requests().msg("too many login attempts, try again later"));
    }

    let verified = state
        .credential_verifier
        .verify(&request.username, &request.password)
        .map_err(|e| HttpError::internal().err(e))?;

    if !verified {
        return Err(HttpError::unauthorized().msg("invalid username or password"));
    }

    let (uid, gid) = resolve_uid_gid(&request.username).map_err(|e| HttpError::internal().err(e))?;

    let session_id = state
        .sessions
        .create(request.username.clone(), uid, gid, state.conf.get().session_ttl)
        .await;

    let session = state.sessions.get(&session_id).await.expect("session was just created");

    let privileged = match bridge::acquire(&state.conf, &session_id, &request.username, &session.runtime, Some(request.password)).await {
        Ok((_control, privileged)) => {
            state.sessions.set_privileged(&session_id, privileged).await;
            privileged
        }
        Err(error) => {
            warn!(%error, username = %request.username, "failed to spawn bridge at login");
            false
        }
    };

    // This service has no TLS-terminating listener of its own (see
    // `listener.rs`); a real deployment puts a TLS-terminating reverse proxy
    // in front of it and this cookie should then be marked `secure`.
    let cookie = Cookie::build((SESSION_COOKIE_NAME, session_id.as_str().to_owned()))
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(false)
        .path("/")
        .build();

    Ok((jar.add(cookie), Json(serde_json::json!({ "success": true, "privileged": privileged }))))
}

/// Looks up a local account's numeric uid/gid by name.
#[cfg(unix)]
fn resolve_uid_gid(username: &str) -> anyhow::Result<(u32, u32)> {
    let c_username = std::ffi::CString::new(username)?;

    // SAFETY: `c_username` is a valid, NUL-terminated C string that outlives
    // the call; `getpwnam` returns either null or a pointer to a statically
    // allocated `passwd` struct that we only read from before it could be
    // overwritten by another `getpwnam`-family call on this thread.
    let passwd = unsafe { libc::getpwnam(c_username.as_ptr()) };
    if passwd.is_null() {
        anyhow::bail!("no such local user: {username}");
    }

    // SAFETY: `passwd` was just checked non-null and points at a valid
    // `passwd` struct for the duration of this read.
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };
    Ok((uid, gid))
}

#[cfg(not(unix))]
fn resolve_uid_gid(_username: &str) -> anyhow::Result<(u32, u32)> {
    anyhow::bail!("resolving local user accounts is only supported on unix")
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Result<CookieJar, HttpError> {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        if let Ok(id) = cookie.value().parse() {
            state.sessions.delete(&id).await;
        }
    }

    Ok(jar.remove(Cookie::from(SESSION_COOKIE_NAME)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_verifier_accepts_only_the_configured_pair() {
        let verifier = StaticVerifier {
            username: "alice".to_owned(),
            password: "hunter2".to_owned(),
        };
        assert!(verifier.verify("alice", "hunter2").unwrap());
        assert!(!verifier.verify("alice", "wrong").unwrap());
        assert!(!verifier.verify("bob", "hunter2").unwrap());
    }

    #[test]
    fn rate_limiter_blocks_after_threshold() {
        let limiter = LoginRateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));
    }

    #[test]
    fn rate_limiter_tracks_usernames_independently() {
        let limiter = LoginRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("alice"));
        assert!(limiter.check("bob"));
        assert!(!limiter.check("alice"));
    }
}
