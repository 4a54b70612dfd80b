//! Engine-level errors.

use nimbus_core::domain::DomainError;
use nimbus_core::ports::remote::{RemoteError, RemoteErrorKind};
use nimbus_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the VFS engine to the FUSE bridge.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Operation needs the network and the oracle reports offline.
    #[error("Offline: {0}")]
    Offline(String),

    #[error("No such item: {0}")]
    NotFound(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// The caller's request was canceled mid-flight.
    #[error("Interrupted")]
    Interrupted,

    /// Cached body disagrees with recorded state and cannot be trusted.
    #[error("Cache corruption: {0}")]
    Corrupt(String),
}

impl VfsError {
    /// True if the failure came from lost connectivity, meaning the
    /// mutation should be routed to the offline log instead of failing.
    pub fn is_connectivity(&self) -> bool {
        match self {
            VfsError::Offline(_) => true,
            VfsError::Remote(e) => e.kind().indicates_offline(),
            _ => false,
        }
    }

    /// True for remote validation rejections, which are surfaced to the
    /// caller and never deferred or retried.
    pub fn is_validation(&self) -> bool {
        match self {
            VfsError::Domain(_) => true,
            VfsError::Remote(e) => e.kind() == RemoteErrorKind::Validation,
            _ => false,
        }
    }
}
