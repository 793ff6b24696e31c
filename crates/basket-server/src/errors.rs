//! Error types for method handling.

use basket_store::StoreError;
use thiserror::Error;

/// Failure inside a method handler. Suppresses the ack and the broadcast.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    /// Stable label for structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Store(e) => e.error_kind(),
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Outcome of dispatching one inbound frame that did not succeed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}
