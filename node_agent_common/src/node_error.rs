use crate::NodeError::LockError;
use serde::{Deserialize, Serialize};
use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Process name \"{0}\" is already in use by another (running) process")]
    DuplicateProcess(String),
    #[error("A listener with id \"{0}\" is already registered")]
    DuplicateListener(String),
    #[error("Unknown process: {0}")]
    UnknownProcess(String),
    #[error("Unknown listener: {0}")]
    UnknownListener(String),
    #[error("Failed to start process: {0}")]
    ProcessStartFailure(String),
    #[error("Process has been destroyed")]
    ProcessDestroyed,
    #[error("Listener \"{id}\" is unreachable: {reason}")]
    ConsumerUnreachable { id: String, reason: String },
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("IO Error: {0}")]
    IoError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Lock Error")]
    LockError,
    #[error("Unknown Error")]
    Unknown,
}

impl NodeError {
    /// True for the errors a caller caused by passing bad configuration.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidArgument(_)
                | NodeError::DuplicateProcess(_)
                | NodeError::DuplicateListener(_)
        )
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::ProtocolError(e.to_string())
    }
}

impl<T> From<PoisonError<T>> for NodeError {
    fn from(_: PoisonError<T>) -> Self {
        LockError
    }
}

impl<T> From<RwLockReadGuard<'_, T>> for NodeError {
    fn from(_: RwLockReadGuard<T>) -> Self {
        LockError
    }
}

impl<T> From<RwLockWriteGuard<'_, T>> for NodeError {
    fn from(_: RwLockWriteGuard<T>) -> Self {
        LockError
    }
}

impl<T> From<MutexGuard<'_, T>> for NodeError {
    fn from(_: MutexGuard<T>) -> Self {
        LockError
    }
}
