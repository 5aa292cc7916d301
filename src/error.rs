//! Crate-level error type with retry classification.

use std::time::Duration;

use crate::backend::SchedulingFailed;
use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::rate_limit::RateLimitError;
use crate::store::StorageError;
use crate::tmux::MuxError;
use crate::validation::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingFailed),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Multiplexer(#[from] MuxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::task::TaskError> for Error {
    fn from(err: crate::task::TaskError) -> Self {
        Error::Validation(err.into())
    }
}

impl Error {
    /// Whether retrying the same request later may succeed.
    ///
    /// Only rate limiting is transient; everything else needs a changed input
    /// or environment.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(RateLimitError::Exceeded { .. } | RateLimitError::Busy(_))
        )
    }

    /// Suggested wait before retrying, for transient errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited(RateLimitError::Exceeded {
                retry_after_secs, ..
            }) => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Validation(_) => 2,
            Error::RateLimited(_) => 3,
            Error::Scheduling(_) => 4,
            _ => 1,
        }
    }
}
