use thiserror::Error;

/// Every failure mode a metabase, engine or GC operation can surface.
#[derive(Error, Debug)]
pub enum VhdStoreError {
    /// The referenced VDI/VHD does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A required advisory lock was unavailable (`try_lock` path).
    #[error("busy: lock {0} unavailable")]
    Busy(String),

    /// A foreign-key or uniqueness invariant would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The external VHD tool returned non-zero.
    #[error("vhd-util failed (exit {exit_code:?}): {stderr}")]
    ToolFailure { exit_code: Option<i32>, stderr: String },

    /// A storage-provider operation failed.
    #[error("storage provider error: {0}")]
    ProviderFailure(String),

    /// On-disk state disagrees with the metabase beyond what the journal
    /// can repair.
    #[error("consistency error: {0}")]
    ConsistencyError(String),

    /// The embedded relational store reported an error.
    #[error("database error: {0}")]
    Database(String),

    /// An invariant of this crate (not the external world) was violated.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type VhdStoreResult<T> = Result<T, VhdStoreError>;

impl From<rusqlite::Error> for VhdStoreError {
    fn from(e: rusqlite::Error) -> Self {
        VhdStoreError::Database(e.to_string())
    }
}
