use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single signaling operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("no such session")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no callee has joined this session yet")]
    NotJoined,
    #[error("no message arrived before the wait deadline")]
    Timeout,
    #[error("session closed while waiting")]
    ClosedDuringWait,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Stable, transport-facing classification of a [`SignalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    NotJoined,
    Timeout,
    SessionClosed,
    InvalidInput,
    UnknownCommand,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotJoined => "not_joined",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::UnknownCommand => "unknown_command",
        }
    }

    /// Whether a well-behaved client should re-issue the same call.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::NotJoined)
    }

    /// Whether the session referenced by the call is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::NotFound | ErrorKind::SessionClosed)
    }
}

impl SignalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::NotFound => ErrorKind::NotFound,
            SignalError::Conflict(_) => ErrorKind::Conflict,
            SignalError::NotJoined => ErrorKind::NotJoined,
            SignalError::Timeout => ErrorKind::Timeout,
            SignalError::ClosedDuringWait => ErrorKind::SessionClosed,
            SignalError::InvalidInput(_) => ErrorKind::InvalidInput,
            SignalError::UnknownCommand(_) => ErrorKind::UnknownCommand,
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        SignalError::Conflict(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        SignalError::InvalidInput(reason.into())
    }

    pub fn to_body(&self) -> ErrorBody {
        let kind = self.kind();
        ErrorBody {
            code: kind,
            message: self.to_string(),
            retryable: kind.is_retryable(),
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;

/// Wire representation of an error, shared by both transports and the clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}
