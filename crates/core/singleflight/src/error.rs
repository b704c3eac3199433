use std::fmt;

use crate::ContextError;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
/// Singleflight error.
///
/// Errors produced by the work itself are never represented here, they are
/// part of the shared value handed back to every caller.
pub enum Error {
    /// The follower's own context was canceled before the result was published
    Canceled,
    /// The follower's own deadline (or the configured follower timeout) passed before the result was published
    DeadlineExceeded,
    /// The leader was dropped or panicked before it could publish a result
    Abandoned,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Canceled => write!(f, "Context canceled while waiting for the in-flight call"),
            Error::DeadlineExceeded => write!(f, "Context deadline exceeded while waiting for the in-flight call"),
            Error::Abandoned => write!(f, "In-flight call was abandoned before producing a result"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ContextError> for Error {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::Canceled => Error::Canceled,
            ContextError::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}
