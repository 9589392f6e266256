//! Error model for the store and auth cores
//!
//! Defines two typed error hierarchies using `thiserror`: [`StoreError`] for
//! the maildir save engine and [`AuthError`] for callers of the auth
//! multiplexer. Severity policy follows the storage layer's contract: disk
//! exhaustion is user-visible, everything else is logged in detail and kept
//! opaque.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::error;

/// Save-engine error type
///
/// Covers all failure modes the maildir save path can surface. `Critical`
/// carries no detail by design: the failing syscall and OS error are logged
/// at error level where the failure happens, and the caller-facing message
/// stays opaque.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Disk exhaustion; the one storage failure shown to the user verbatim
    #[error("Not enough disk space")]
    NoSpace,
    /// Any other storage failure (logged with syscall detail at the site)
    #[error("internal error")]
    Critical,
    /// The uidlist dotlock could not be acquired within the deadline
    #[error("timeout while waiting for uidlist lock")]
    UidlistLockTimeout,
}

impl StoreError {
    /// Classify an I/O failure from the save path
    ///
    /// `ENOSPC` becomes [`StoreError::NoSpace`]; everything else is logged
    /// with the failing syscall and path and becomes [`StoreError::Critical`].
    pub fn from_io(syscall: &str, path: &Path, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            return Self::NoSpace;
        }
        error!(syscall, path = %path.display(), %err, "storage operation failed");
        Self::Critical
    }
}

/// Auth-multiplexer error type
///
/// Surfaced by `init_request` when no worker can take the exchange. Workers
/// dying mid-exchange are not an error here; those abort through the
/// null-reply callback instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No connected worker advertises the requested mechanism
    #[error("unsupported authentication mechanism")]
    UnsupportedMechanism,
    /// Every worker advertising the mechanism is saturated
    #[error("authentication servers busy")]
    AllWorkersBusy,
    /// No worker is connected at all; a reconnect scan has been scheduled
    #[error("no authentication workers connected, try again later")]
    NoConnectedWorker,
}

/// Result alias for the save engine
pub type StoreResult<T> = Result<T, StoreError>;

/// Result alias for auth-multiplexer callers
pub type AuthResult<T> = Result<T, AuthError>;
