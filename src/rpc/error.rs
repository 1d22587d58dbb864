use serde_json::Value;

use super::envelope::StructuredError;

/// Local, synchronous errors raised by the messenger itself
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("method '{0}' is already registered")]
    DuplicateMethod(String),

    #[error("transport inbound listener is already attached")]
    ListenerAttached,

    #[error("messenger must be created within a tokio runtime")]
    NoRuntime,
}

/// Errors delivered through a call's deferred result
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("remote call failed: {0}")]
    Remote(RemoteFailure),

    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("messenger dropped before call '{0}' settled")]
    Abandoned(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CallError {
    /// The structured error sent by the remote side, if any
    pub fn structured(&self) -> Option<&StructuredError> {
        match self {
            CallError::Remote(RemoteFailure::Structured(error)) => Some(error),
            _ => None,
        }
    }
}

/// Failure data sent by the remote side of a call
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFailure {
    /// Normalized `{message, stack}` error
    Structured(StructuredError),
    /// Whatever non-error payload the remote chose to send
    Raw(Value),
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFailure::Structured(error) => write!(f, "{}", error.message),
            RemoteFailure::Raw(value) => write!(f, "{}", value),
        }
    }
}

/// Handler failure that is sent to the caller verbatim instead of being
/// normalized into a [`StructuredError`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("raw failure: {0}")]
pub struct RawFailure(pub Value);

/// Errors raised while executing an inbound call. These never reach local
/// code; they are converted to structured errors and sent back.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("method '{0}' is not registered")]
    UnknownMethod(String),

    #[error("handler for '{method}' panicked: {message}")]
    HandlerPanicked { method: String, message: String },
}

/// Transport-level send failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport channel is closed")]
    ChannelClosed,
}
