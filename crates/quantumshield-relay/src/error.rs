//! Relay error taxonomy.
//!
//! Every failure a client can observe carries a stable wire code. Client-side
//! failures (4xx) surface the reason; server-side failures surface a generic
//! message unless detailed errors are enabled for development builds. Secret
//! material never appears in any error message.

use std::sync::atomic::{AtomicBool, Ordering};

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

static DETAILED_ERRORS: AtomicBool = AtomicBool::new(false);

/// Enable full 5xx detail in responses. Development builds only.
pub fn set_detailed_errors(enabled: bool) {
    DETAILED_ERRORS.store(enabled, Ordering::Relaxed);
}

fn detailed_errors() -> bool {
    DETAILED_ERRORS.load(Ordering::Relaxed)
}

/// Relay-visible failures with stable wire codes.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Missing, invalid, or expired token, or a user-id mismatch. The
    /// sub-reason is deliberately not revealed.
    #[error("authentication error")]
    Authentication,

    #[error("sender id does not match the authenticated connection")]
    UnauthorizedSender,

    #[error("envelope is missing required fields; encryption is mandatory")]
    IncompleteEnvelope,

    #[error("users are not friends")]
    NotFriend,

    #[error("envelope signature verification failed")]
    BadSignature,

    #[error("recipient has no live connection")]
    RecipientOffline,

    #[error("payload exceeds the maximum allowed size")]
    PayloadTooLarge,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("origin not allowed")]
    OriginNotAllowed,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable code used in WebSocket error events and HTTP bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication_error",
            Self::UnauthorizedSender => "unauthorized_sender",
            Self::IncompleteEnvelope => "incomplete_envelope",
            Self::NotFriend => "not_friend",
            Self::BadSignature => "bad_signature",
            Self::RecipientOffline => "recipient_offline",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::OriginNotAllowed => "origin_not_allowed",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to put on the wire.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(detail) if detailed_errors() => format!("internal error: {detail}"),
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::UnauthorizedSender | Self::NotFriend | Self::OriginNotAllowed => {
                StatusCode::FORBIDDEN
            }
            Self::IncompleteEnvelope | Self::BadSignature | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::RecipientOffline => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let Self::Internal(detail) = self {
            tracing::error!("internal error: {detail}");
        }

        let retry_after = match self {
            Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };

        let mut builder = HttpResponse::build(self.status_code());
        if let Some(secs) = retry_after {
            builder.insert_header(("Retry-After", secs.to_string()));
        }
        builder.json(ErrorBody {
            error: self.code(),
            message: self.public_message(),
            retry_after_seconds: retry_after,
        })
    }
}
