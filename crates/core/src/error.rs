//! Error taxonomy shared by every store backend

use std::fmt;

/// Store error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Key absent in the requested state
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed key, cursor or argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// State-entry precondition or immutable field violated
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Transient backend failure
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Stored bytes do not decode into a record
    #[error("data loss: {0}")]
    DataLoss(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Kind of a [`StoreError`], without its message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    DataLoss,
    Internal,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            StoreError::Unavailable(_) => ErrorKind::Unavailable,
            StoreError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            StoreError::DataLoss(_) => ErrorKind::DataLoss,
            StoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::FailedPrecondition => "FailedPrecondition",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::DataLoss => "DataLoss",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
