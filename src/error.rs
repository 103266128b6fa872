//! Error types for the AMI client

use crate::connection::DisconnectReason;

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors surfaced by the AMI client.
///
/// Action-level failures (`ActionFailed`, `Timeout`, `Transport`, ...) reach
/// the caller through the same delivery path as successful results.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Socket I/O failure while connecting or writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply (or no connection) within the deadline.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// The connection closed while the operation was in progress.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client is not in the `Ready` state.
    #[error("not connected")]
    NotConnected,

    /// The transport failed while the action was pending.
    #[error("transport error: {0}")]
    Transport(DisconnectReason),

    /// Events were dropped because the application fell behind.
    #[error("event queue full, events were dropped")]
    QueueFull,

    /// The byte stream does not look like AMI.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// Description of the violation.
        message: String,
    },

    /// Asterisk answered with a non-success `Response`.
    #[error("action failed: {response}{}", .message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default())]
    ActionFailed {
        /// The raw `Response` value (usually `Error`).
        response: String,
        /// The `Message` header, when Asterisk supplied one.
        message: Option<String>,
    },

    /// A strict list completed with a different number of items than declared.
    #[error("list count mismatch: declared {declared}, collected {collected}")]
    ListCountMismatch {
        /// Count carried by the terminator event.
        declared: usize,
        /// Items actually collected.
        collected: usize,
    },

    /// A response lacked the field the action's shape names.
    #[error("response is missing field {field}")]
    MissingField {
        /// Name of the absent header.
        field: String,
    },

    /// Another action with the same correlation key is still pending.
    #[error("action id {action_id} is already pending")]
    DuplicateActionId {
        /// The colliding `ActionID`, or `(unlabeled)`.
        action_id: String,
    },

    /// Login was rejected.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Server message or local validation failure.
        reason: String,
    },
}

impl AmiError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(reason: impl Into<String>) -> Self {
        AmiError::AuthFailed {
            reason: reason.into(),
        }
    }

    /// `true` when the error ended the connection rather than one action.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::ConnectionClosed
                | AmiError::NotConnected
                | AmiError::Transport(_)
        )
    }
}
