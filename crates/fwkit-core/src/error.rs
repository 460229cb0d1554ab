//! Shared error taxonomy for the platform core.
//!
//! Errors fall into three camps the callers care about:
//! - expected absence (`NotFound`, `InvalidFile`, `NotSupported`): handled
//!   by trying an alternative or skipping the item,
//! - environment failures (`Io`, `Storage`, `BrokenSystem`): propagated up
//!   with a description of what was being attempted,
//! - `Internal`: API misuse, a bug in the caller.

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum Error {
    /// The requested thing does not exist; try an alternative or skip.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation cannot be performed on this system or file.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The file exists but does not parse as the expected format.
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// A system-level precondition does not hold, e.g. no efivar space.
    #[error("broken system: {0}")]
    BrokenSystem(String),

    /// API misuse; unconditionally a bug in the caller.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is an expected absence rather than a hard failure.
    ///
    /// Bulk operations use this to decide between skipping an item and
    /// aborting the whole collection.
    pub fn is_absence(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::InvalidFile(_) | Error::NotSupported(_)
        )
    }
}
