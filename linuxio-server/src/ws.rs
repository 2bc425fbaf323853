//! The `/ws` handler: authenticates the session cookie, makes sure a bridge
//! is running for it (spawning one on first use), and hands the upgraded
//! socket off to the relay.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;

use crate::auth::SESSION_COOKIE_NAME;
use crate::http::HttpError;
use crate::{bridge, relay, AppState};

pub async fn upgrade(State(state): State<AppState>, jar: CookieJar, ws: WebSocketUpgrade) -> Result<Response, HttpError> {
    let session_id = jar
        .get(SESSION_COOKIE_NAME)
        .and_then(|cookie| cookie.value().parse().ok())
        .ok_or_else(|| HttpError::unauthorized().msg("no session cookie"))?;

    let session = state
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| HttpError::unauthorized().msg("session expired or unknown"))?;

    state.sessions.touch(&session_id).await;

    let username = session.username.clone();
    let runtime = session.runtime.clone();
    let conf = state.conf.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let control = match bridge::acquire(&conf, &session_id, &username, &runtime, None).await {
            Ok((control, _privileged)) => control,
            Err(error) => {
                warn!(%session_id, %error, "failed to start bridge for session");
                return;
            }
        };

        let (close_tx, close_rx) = tokio::sync::mpsc::unbounded_channel();
        runtime.register_websocket(close_tx).await;

        if let Err(error) = relay::run_relay(socket, control, close_rx).await {
            warn!(%session_id, %error, "relay ended with an error");
        }
    }))
}
