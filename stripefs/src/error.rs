use serde_derive::{Deserialize, Serialize};

/// Result alias used across the library.
pub type SResult<T> = std::result::Result<T, Error>;

/// stripefs errors.
///
/// Everything below the block drivers is captured into one of these
/// variants; only the drivers turn them into client-visible replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A 2PC prepare was rejected because the block already has a
    /// pending log. Carries the committed version reported by the node.
    Abort(u64),

    /// Malformed wire data. The owning connection must be closed.
    Decode(String),

    /// An I/O failure, including connection resets and EOF mid-message.
    Io(String),

    /// A request-wide deadline fired.
    Timeout(String),

    /// The peer answered with an unexpected packet type.
    UnexpectedPacket(String),

    /// Invalid configuration or request arguments.
    Value(String),

    /// Anything else: poisoned locks, closed channels, serialization.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort(committed) => {
                write!(f, "prepare aborted, committed version {}", committed)
            }
            Error::Decode(s) => write!(f, "decode error: {}", s),
            Error::Io(s) => write!(f, "io error: {}", s),
            Error::Timeout(s) => write!(f, "timeout: {}", s),
            Error::UnexpectedPacket(s) => write!(f, "unexpected packet: {}", s),
            Error::Value(s) => write!(f, "{}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl Error {
    /// Renders the error as a client-visible reply body. The `Error:`
    /// prefix is part of the external contract; clients match on it.
    pub fn to_reply(&self) -> Vec<u8> {
        let reason = match self {
            Error::Abort(_) => "Error: Found Pending 2PC Log".to_string(),
            Error::Timeout(what) => format!("Error: {}", what),
            other => format!("Error: {}", other),
        };
        reason.into_bytes()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Value(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Internal("channel receiver closed".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Io("response channel dropped".to_string())
    }
}
