use thiserror::Error;

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical status code attached to every error. Clients dispatch on the
/// code; the message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    AlreadyExists,
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    OutOfRange,
    Aborted,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

/// Engine error: a status code plus a human-readable message. Errors are
/// values; no operation unwinds past its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> StatusCode {
        match self {
            Error::AlreadyExists(_) => StatusCode::AlreadyExists,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Error::OutOfRange(_) => StatusCode::OutOfRange,
            Error::Aborted(_) => StatusCode::Aborted,
            Error::Cancelled(_) => StatusCode::Cancelled,
            Error::DeadlineExceeded(_) => StatusCode::DeadlineExceeded,
            Error::Internal(_) => StatusCode::Internal,
        }
    }

    /// Whether the client should retry the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), StatusCode::Aborted)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Error::Aborted(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Error::DeadlineExceeded(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
