use axum::http::StatusCode;
use lendbot_contracts::{ErrorBody, ErrorResponse, Toast};
use lendbot_kernel::{ActionError, CodecError};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("this card has expired, please use the latest card")]
    StaleCard,
    #[error("{0}")]
    InvalidSelection(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("upstream call failed: {0}")]
    UpstreamFailure(String),
    #[error("duplicate event {0}")]
    DuplicateEvent(String),
    #[error("unsupported event type {0:?}")]
    UnknownEvent(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl BotError {
    pub fn code(&self) -> &'static str {
        match self {
            BotError::StaleCard => "stale_card",
            BotError::InvalidSelection(_) => "invalid_selection",
            BotError::PermissionDenied(_) => "permission_denied",
            BotError::NotFound(_) => "not_found",
            BotError::UpstreamFailure(_) => "upstream_failure",
            BotError::DuplicateEvent(_) => "duplicate_event",
            BotError::UnknownEvent(_) => "unknown_event",
            BotError::BadRequest(_) => "bad_request",
            BotError::Conflict(_) => "conflict",
            BotError::Store(_) => "store_failure",
        }
    }

    /// Toast shown for errors recovered inside the card flow. `None` for
    /// kinds that are not user-facing.
    pub fn toast(&self) -> Option<Toast> {
        match self {
            BotError::StaleCard
            | BotError::InvalidSelection(_)
            | BotError::PermissionDenied(_)
            | BotError::NotFound(_)
            | BotError::UpstreamFailure(_)
            | BotError::Conflict(_) => Some(Toast::error(format!("Error: {self}"))),
            _ => None,
        }
    }

    /// HTTP status for errors that escape to the webhook response.
    pub fn status(&self) -> StatusCode {
        match self {
            BotError::UnknownEvent(_) | BotError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BotError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BotError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::OK,
        }
    }

    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        }
    }
}

impl From<StoreError> for BotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BotError::NotFound(what),
            StoreError::Conflict(msg) => BotError::Conflict(msg),
            other => BotError::Store(other.to_string()),
        }
    }
}

impl From<GatewayError> for BotError {
    fn from(err: GatewayError) -> Self {
        BotError::UpstreamFailure(err.to_string())
    }
}

impl From<CodecError> for BotError {
    fn from(err: CodecError) -> Self {
        BotError::BadRequest(err.to_string())
    }
}

impl From<ActionError> for BotError {
    fn from(err: ActionError) -> Self {
        BotError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_kinds_become_toasts() {
        assert!(BotError::StaleCard.toast().is_some());
        assert!(BotError::PermissionDenied("x".into()).toast().is_some());
        assert!(BotError::DuplicateEvent("e".into()).toast().is_none());
        assert_eq!(
            BotError::UnknownEvent("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(BotError::Store("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn store_not_found_keeps_its_kind() {
        let err: BotError = StoreError::NotFound("item 1".into()).into();
        assert!(matches!(err, BotError::NotFound(_)));
        assert_eq!(err.body().error.code, "not_found");
    }
}
