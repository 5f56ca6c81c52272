//! Error taxonomy for the coordinator's public boundary.
//!
//! Internal collaborators (the store, the cache) return `anyhow::Result`
//! the way the teacher's `PgPool` does; this module is only reached for by
//! code that sits at a request boundary and needs a machine-readable kind
//! plus a safe, user-facing message (§7).

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    NotAuthorized,
    NotAMember,
    NotFound,
    Conflict,
    InvalidTransition,
    NotYourInstance,
    NotActive,
    AlreadyStarted,
    Unavailable,
    ServerError,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::NotAuthorized => 403,
            ErrorKind::NotAMember => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidTransition => 400,
            ErrorKind::NotYourInstance => 403,
            ErrorKind::NotActive => 400,
            ErrorKind::AlreadyStarted => 409,
            ErrorKind::Unavailable => 503,
            ErrorKind::ServerError => 500,
        }
    }
}

/// A request-boundary error: kind, safe message, and a request id for
/// support reference. Never carries a stack trace or library-specific text.
#[derive(Debug, Error, Clone, Serialize)]
#[error("{kind:?}: {message}")]
pub struct CoordinatorError {
    pub kind: ErrorKind,
    pub message: String,
    pub request_id: String,
}

impl CoordinatorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    pub fn invalid_input(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message, request_id)
    }

    pub fn not_authorized(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthorized, message, request_id)
    }

    pub fn not_a_member(request_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAMember, "caller is not a member of this group", request_id)
    }

    pub fn not_found(request_id: impl Into<String>, resource: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{resource} not found"), request_id)
    }

    pub fn conflict(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message, request_id)
    }

    pub fn invalid_transition(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransition, message, request_id)
    }

    pub fn not_your_instance(request_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::NotYourInstance,
            "instance does not belong to the caller",
            request_id,
        )
    }

    pub fn not_active(request_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotActive, "instance is not active", request_id)
    }

    pub fn already_started(request_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyStarted, "instance already active", request_id)
    }

    pub fn unavailable(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message, request_id)
    }

    /// Store/auth outages and anything else unexpected. The caller passes
    /// an `operation` name for the caller's own logging, but it never ends
    /// up in `message` — only the request id is safe to hand back to a
    /// client, per §7's "no internal identifiers beyond the resource id
    /// the caller already supplied".
    pub fn server_error(request_id: impl Into<String>, _operation: &str) -> Self {
        Self::new(ErrorKind::ServerError, "internal error, please retry", request_id)
    }
}
