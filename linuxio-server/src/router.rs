//! Top-level route table. Kept in its own module so the wiring of
//! `/auth/*` and `/ws` stays in one place regardless of how many handler
//! modules back them.

use axum::routing::{get, post};
use axum::Router;

use crate::{auth, ws, AppState};

pub fn make_router(state: AppState) -> Router<()> {
    Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/ws", get(ws::upgrade))
        .with_state(state)
}
