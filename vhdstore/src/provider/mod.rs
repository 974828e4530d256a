//! The capability set the engine and GC need from whatever backend holds
//! the storage repository, expressed as one trait. Per-SR locks are
//! folded directly into it since every implementation needs a concrete
//! way to back them.

mod filesystem;

use std::path::PathBuf;

use vhdstore_shared::VhdStoreResult;

pub use filesystem::FilesystemProvider;

use crate::locks::LockGuard;

/// Whether a provider handle was opened for mutation or read-only access.
/// Read-only operations (stat, ls) never need this to be `ReadWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    ReadOnly,
    ReadWrite,
}

pub trait StorageProvider: Send + Sync {
    /// Path to this SR's metabase file.
    fn metadata_path(&self) -> PathBuf;

    /// Create the backing store for volume `name` sized `size_bytes`,
    /// returning its path. The VHD header itself is written separately by
    /// the VHD tool; this only provisions the backing file/extent.
    fn volume_create(&self, name: &str, size_bytes: u64) -> VhdStoreResult<PathBuf>;

    fn volume_destroy(&self, name: &str) -> VhdStoreResult<()>;

    fn volume_rename(&self, old_name: &str, new_name: &str) -> VhdStoreResult<PathBuf>;

    fn volume_resize(&self, name: &str, new_size_bytes: u64) -> VhdStoreResult<()>;

    fn volume_path(&self, name: &str) -> PathBuf;

    fn volume_phys_size(&self, name: &str) -> VhdStoreResult<u64>;

    /// Provider-specific prefix embedded in datapath URIs:
    /// `vhd+tapdisk://<prefix><vdi_uuid>`.
    fn uri_prefix(&self) -> String;

    /// A stable identifier for this SR, used to namespace run-directory
    /// state (GC touch files, tap metadata).
    fn unique_id(&self) -> String;

    fn lock(&self, name: &str) -> VhdStoreResult<LockGuard>;

    fn try_lock(&self, name: &str) -> VhdStoreResult<Option<LockGuard>>;
}
