//! LIME channel error types.
//!
//! # Error Classification
//!
//! Errors fall into two groups:
//!
//! - **Local validation**: state mismatches, invalid arguments, unsupported
//!   options and pipeline completion. These are raised before any I/O and are
//!   never retried.
//! - **Channel failures**: transport errors, timeouts, protocol violations and
//!   sessions failed by the remote peer. The on-demand layer may recover from
//!   these by discarding the channel and building a new one, see
//!   [`LimeError::is_recoverable`].
//!
//! Cancellation is its own variant and is never conflated with a failure.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::SessionState;

/// LIME protocol errors.
#[derive(Error, Debug)]
pub enum LimeError {
    /// Operation is not valid for the current session state.
    #[error("Cannot {operation} in the '{state}' session state")]
    StateMismatch {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Session state at the time of the call.
        state: SessionState,
    },

    /// A required argument is missing or empty.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested compression, encryption or scheme is unavailable.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Operation is not valid for the current object state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Malformed node, identity or URI string.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Transport I/O failure or remote disconnect.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation did not complete in the configured time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected envelope during negotiation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote peer failed the session.
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// Write attempted after the outbound pipeline was completed.
    #[error("The channel pipeline is complete")]
    PipelineComplete,

    /// Operation aborted by the caller's cancellation signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for LIME operations
pub type Result<T> = std::result::Result<T, LimeError>;

impl LimeError {
    /// Build a state mismatch error for `operation`.
    pub fn state_mismatch(operation: &'static str, state: SessionState) -> Self {
        LimeError::StateMismatch { operation, state }
    }

    /// Check if this is a cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LimeError::Cancelled)
    }

    /// Take back an error shared with lifecycle handlers, copying it if a
    /// handler kept a reference.
    pub fn from_shared(error: Arc<LimeError>) -> Self {
        Arc::try_unwrap(error).unwrap_or_else(|shared| shared.duplicate())
    }

    fn duplicate(&self) -> Self {
        match self {
            LimeError::StateMismatch { operation, state } => LimeError::StateMismatch {
                operation: *operation,
                state: *state,
            },
            LimeError::InvalidArgument(m) => LimeError::InvalidArgument(m.clone()),
            LimeError::NotSupported(m) => LimeError::NotSupported(m.clone()),
            LimeError::InvalidOperation(m) => LimeError::InvalidOperation(m.clone()),
            LimeError::InvalidFormat(m) => LimeError::InvalidFormat(m.clone()),
            LimeError::Transport(m) => LimeError::Transport(m.clone()),
            LimeError::Timeout(m) => LimeError::Timeout(m.clone()),
            LimeError::Protocol(m) => LimeError::Protocol(m.clone()),
            LimeError::SessionFailed(m) => LimeError::SessionFailed(m.clone()),
            LimeError::PipelineComplete => LimeError::PipelineComplete,
            LimeError::Cancelled => LimeError::Cancelled,
            LimeError::Config(m) => LimeError::Config(m.clone()),
            LimeError::Json(e) => LimeError::Protocol(format!("Invalid envelope: {e}")),
            LimeError::Io(e) => LimeError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// Check if the failure came from the channel itself rather than from local
    /// validation, meaning a freshly built channel could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LimeError::Transport(_)
                | LimeError::Timeout(_)
                | LimeError::Protocol(_)
                | LimeError::SessionFailed(_)
                | LimeError::Json(_)
                | LimeError::Io(_)
        )
    }
}

impl From<toml::de::Error> for LimeError {
    fn from(err: toml::de::Error) -> Self {
        LimeError::Config(err.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for LimeError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::Io(e) => LimeError::Io(e),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                LimeError::Transport("Envelope frame exceeds the maximum length".to_string())
            },
        }
    }
}
