//! Message envelope and structured error types
//!
//! An [`Envelope`] is the unit exchanged over the channel. The JSON field
//! names (`action`, `type`, `data`, `callNumber`, `resolved`) are kept
//! compatible with the messenger peers that already speak this format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RemoteFailure;

/// Separator between method name and sequence number in a correlation key
pub const KEY_SEPARATOR: char = '$';

/// Kind of envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Ask the far side to run a registered method
    Execute,
    /// Result (or failure) of a previous `Execute`
    Callback,
}

/// Unit of information exchanged over the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "action")]
    pub kind: EnvelopeKind,

    /// Method name for `Execute`, `name$sequence` for `Callback`
    #[serde(rename = "type")]
    pub name: String,

    /// Arguments, result value or failure data
    #[serde(rename = "data", default)]
    pub payload: Value,

    #[serde(rename = "callNumber")]
    pub sequence_number: u64,

    /// Only meaningful for `Callback`
    #[serde(rename = "resolved")]
    pub succeeded: bool,
}

impl Envelope {
    /// Create an `Execute` envelope for an outbound call
    pub fn execute(name: impl Into<String>, payload: Value, sequence_number: u64) -> Self {
        Self {
            kind: EnvelopeKind::Execute,
            name: name.into(),
            payload,
            sequence_number,
            succeeded: true,
        }
    }

    /// Create a successful `Callback` answering `method` / `sequence_number`
    pub fn fulfilled(method: &str, sequence_number: u64, value: Value) -> Self {
        Self {
            kind: EnvelopeKind::Callback,
            name: correlation_key(method, sequence_number),
            payload: value,
            sequence_number,
            succeeded: true,
        }
    }

    /// Create a failed `Callback` answering `method` / `sequence_number`
    pub fn rejected(method: &str, sequence_number: u64, failure: Value) -> Self {
        Self {
            kind: EnvelopeKind::Callback,
            name: correlation_key(method, sequence_number),
            payload: failure,
            sequence_number,
            succeeded: false,
        }
    }

    pub fn is_execute(&self) -> bool {
        self.kind == EnvelopeKind::Execute
    }

    /// Serialize to the wire text form
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse from the wire text form
    pub fn decode(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

/// Build the correlation key binding a call to its response
pub fn correlation_key(method: &str, sequence_number: u64) -> String {
    format!("{}{}{}", method, KEY_SEPARATOR, sequence_number)
}

/// Split a correlation key back into method name and sequence number.
///
/// Method names may themselves contain the separator, so the split happens
/// at the last occurrence.
pub fn split_correlation_key(key: &str) -> Option<(&str, u64)> {
    let (method, sequence) = key.rsplit_once(KEY_SEPARATOR)?;
    let sequence = sequence.parse().ok()?;
    Some((method, sequence))
}

/// Normalized, serializable representation of a failure crossing the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub message: String,
    pub stack: Vec<String>,
}

impl StructuredError {
    pub fn new(message: impl Into<String>, stack: Vec<String>) -> Self {
        Self {
            message: message.into(),
            stack,
        }
    }

    /// Capture an `anyhow` error: the message is the outermost error,
    /// the stack is the whole cause chain, outermost first.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            stack: error.chain().map(|cause| cause.to_string()).collect(),
        }
    }

    /// Capture any `std::error::Error` together with its sources
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            stack,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "stack": self.stack,
        })
    }

    /// Interpret the payload of a failed callback.
    ///
    /// Payloads with the `{message, stack}` shape are structured errors;
    /// anything else is passed through untouched.
    pub fn classify(payload: Value) -> RemoteFailure {
        match serde_json::from_value::<StructuredError>(payload.clone()) {
            Ok(error) => RemoteFailure::Structured(error),
            Err(_) => RemoteFailure::Raw(payload),
        }
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StructuredError {}
