use crate::bg_error::BackgroundErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Why a flush did not produce a table file.
///
/// Every variant implies the same outcome: no new file is visible and the
/// write buffer still holds the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushFailureReason {
    /// The reservation for the estimated table size was denied
    SpaceLimitExceeded { requested: u64, available: u64 },
    /// Writing, syncing or renaming the table file failed
    IoFailure { detail: String },
    /// The reservation outlived its deadline before the commit
    ReservationExpired,
}

impl std::fmt::Display for FlushFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpaceLimitExceeded {
                requested,
                available,
            } => write!(
                f,
                "space limit exceeded (requested {} bytes, {} available)",
                requested, available
            ),
            Self::IoFailure { detail } => write!(f, "I/O failure: {}", detail),
            Self::ReservationExpired => write!(f, "space reservation expired"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Space limit reached: requested {requested} bytes, {available} available of {budget}")]
    SpaceLimit {
        requested: u64,
        available: u64,
        budget: u64,
    },

    #[error("Background error ({kind}): {detail}")]
    BackgroundError {
        kind: BackgroundErrorKind,
        detail: String,
    },

    #[error("Resume rejected: {total_size} bytes used (+{pending} pending, {requested} needed) of {budget}")]
    ResumeStillOverBudget {
        total_size: u64,
        pending: u64,
        requested: u64,
        budget: u64,
    },

    #[error("Flush failed: {reason}")]
    FlushFailed { reason: FlushFailureReason },

    #[error("Unknown storage path: {}", .0.display())]
    UnknownPath(PathBuf),

    #[error("Unknown column family: {0}")]
    UnknownColumnFamily(String),

    #[error("Reservation {id} expired")]
    ReservationExpired { id: u64 },

    #[error("Write error: {0}")]
    Write(String),

    #[error("Corrupt table file: {0}")]
    Corruption(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that a later `resume` (after the operator frees space
    /// or raises the budget) may clear.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SpaceLimit { .. }
                | Error::BackgroundError { .. }
                | Error::ResumeStillOverBudget { .. }
                | Error::FlushFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
