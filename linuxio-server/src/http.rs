//! HTTP error type returned by every handler.
//!
//! The full cause chain is logged server-side via `tracing`; only the
//! status code and a short, safe message ever reach the client.

use core::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub struct HttpError {
    status: StatusCode,
    msg: Option<String>,
    source: Option<anyhow::Error>,
    location: &'static core::panic::Location<'static>,
}

impl HttpError {
    #[track_caller]
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            msg: None,
            source: None,
            location: core::panic::Location::caller(),
        }
    }

    #[track_caller]
    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    #[track_caller]
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED)
    }

    #[track_caller]
    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN)
    }

    #[track_caller]
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    #[track_caller]
    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS)
    }

    #[track_caller]
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    #[track_caller]
    pub fn bad_gateway() -> Self {
        Self::new(StatusCode::BAD_GATEWAY)
    }

    #[must_use]
    pub fn msg(mut self, msg: impl fmt::Display) -> Self {
        self.msg = Some(msg.to_string());
        self
    }

    #[must_use]
    pub fn err(mut self, error: impl Into<anyhow::Error>) -> Self {
        self.source = Some(error.into());
        self
    }
}

impl fmt::Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpError")
            .field("status", &self.status)
            .field("msg", &self.msg)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let msg = self.msg.unwrap_or_else(|| {
            self.status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_owned()
        });

        match &self.source {
            Some(source) => {
                error!(error = format!("{source:#}"), status = %self.status, location = %self.location, "request failed")
            }
            None => {
                warn!(status = %self.status, location = %self.location, "request failed: {msg}")
            }
        }

        (self.status, msg).into_response()
    }
}
