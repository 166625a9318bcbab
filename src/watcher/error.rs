//! Error types for the watcher system.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::descriptor::WatchHandle;

/// Why a directory could not be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationReason {
    /// The path already has a descriptor.
    AlreadyWatched,
    /// The path does not exist (or vanished before registration completed).
    Missing,
    /// The path exists but is not a directory.
    NotADirectory,
    /// The source was refused access to the directory.
    PermissionDenied,
    /// The source ran out of watches.
    LimitReached,
    /// Any other rejection reported by the source.
    Rejected(String),
}

impl fmt::Display for RegistrationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyWatched => f.write_str("already watched"),
            Self::Missing => f.write_str("no such directory"),
            Self::NotADirectory => f.write_str("not a directory"),
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::LimitReached => f.write_str("watch limit reached"),
            Self::Rejected(reason) => f.write_str(reason),
        }
    }
}

/// Failures reported by a notification source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Event queue overflowed, some changes were lost")]
    Overflow,

    #[error("Watch {0} is not registered with the source")]
    UnknownHandle(WatchHandle),

    #[error("Notification source I/O failure: {0}")]
    Io(String),

    #[error("Notification source failure: {0}")]
    Backend(String),

    #[error("Notification source closed")]
    Closed,
}

impl SourceError {
    /// Whether the source can no longer deliver records.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Closed)
    }
}

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {path}: {reason}")]
    Registration {
        path: PathBuf,
        reason: RegistrationReason,
    },

    #[error("No descriptor for {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to walk {path}: {reason}")]
    Traversal { path: PathBuf, reason: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Root watch directory {path} was deleted")]
    RootDeleted { path: PathBuf },

    #[error("Invalid watcher state: {reason}")]
    InvalidState { reason: String },

    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Failed to load config: {reason}")]
    Config { reason: String },
}

impl WatchError {
    pub(crate) fn registration(path: impl Into<PathBuf>, reason: RegistrationReason) -> Self {
        WatchError::Registration {
            path: path.into(),
            reason,
        }
    }

    /// True for conditions after which the manager cannot keep running.
    pub fn is_fatal(&self) -> bool {
        match self {
            WatchError::RootDeleted { .. } => true,
            WatchError::Source(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// True when registration failed because the directory no longer exists.
    pub fn is_vanished(&self) -> bool {
        matches!(
            self,
            WatchError::Registration {
                reason: RegistrationReason::Missing,
                ..
            }
        )
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}

pub type WatchResult<T> = Result<T, WatchError>;
