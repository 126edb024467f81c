//! All coordinator-internal errors.

use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use crate::{asset::BackendError, auth::AuthError, storage::StorageError};

/// Enum to handle coordinator-related errors.
///
/// These never reach a client; client-facing failures are
/// [`crate::protocol::messages::MsgError`] values returned to the
/// originating request.
#[derive(Debug)]
pub enum CoordinatorError {
    /// Represents a standard IO error.
    IO(std::io::Error),
    /// Represents a general error with a static message.
    General(&'static str),
    /// Represents a mutex or rwlock poisoning error.
    MutexPoison,
    /// Represents an error from the persistent store.
    Storage(StorageError),
    /// Represents an error from the auth manager.
    Auth(AuthError),
    /// Represents an error from an asset backend.
    Backend(BackendError),
    /// Represents a snapshot encode/decode failure.
    Cbor(serde_cbor::Error),
    /// Represents an unusable or inconsistent state file.
    Snapshot(String),
}

impl From<std::io::Error> for CoordinatorError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_cbor::Error> for CoordinatorError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Cbor(value)
    }
}

impl From<StorageError> for CoordinatorError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<AuthError> for CoordinatorError {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

impl From<BackendError> for CoordinatorError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

impl<'a, T> From<PoisonError<RwLockReadGuard<'a, T>>> for CoordinatorError {
    fn from(_: PoisonError<RwLockReadGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}

impl<'a, T> From<PoisonError<RwLockWriteGuard<'a, T>>> for CoordinatorError {
    fn from(_: PoisonError<RwLockWriteGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}

impl<'a, T> From<PoisonError<MutexGuard<'a, T>>> for CoordinatorError {
    fn from(_: PoisonError<MutexGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}
