//! Typed interface over the external VHD utility.
//!
//! `vhd-util` is invoked as a subprocess; every operation maps to one
//! invocation of the corresponding `vhd-util` subcommand. A non-zero exit
//! is always reported as [`vhdstore_shared::VhdStoreError::ToolFailure`]
//! carrying the captured stderr.

mod process;

#[cfg(any(test, feature = "testing"))]
mod fake;

use std::path::Path;

pub use process::ProcessVhdTool;
#[cfg(any(test, feature = "testing"))]
pub use fake::FakeVhdTool;

use vhdstore_shared::VhdStoreResult;

/// One mebibyte, the unit `vhd-util` speaks in for `-s`/`-S`.
pub const MEBIBYTE: u64 = 1 << 20;

/// Maximum VHD size (in MiB) reserved in the header at `create`/`snapshot`
/// time so later `resize` calls never need to relocate the BAT. 2 TiB.
pub const MAX_SIZE_MIB: u64 = 2 * MEBIBYTE;

/// What `snapshot` actually did, observed by reading the new VHD's parent
/// pointer back. The caller (the clone algorithm in [`crate::engine`]) uses
/// this to detect the parent-empty optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The new VHD's on-disk parent is the VHD that was snapshotted.
    LinkedToSource,
    /// The source was empty: `vhd-util` rebased the new VHD onto the
    /// source's own parent instead (the parent-empty optimization).
    LinkedToSourceParent,
}

/// Operations the engine and GC need from the external VHD utility.
pub trait VhdTool: Send + Sync {
    /// Create a new VHD at `path` with logical size `size_mib` MiB.
    fn create(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()>;

    /// Snapshot `parent_path` into a new differencing VHD at `new_path`.
    ///
    /// If `force_link` is false and `parent_path` has no allocated blocks,
    /// the tool performs the parent-empty optimization and the caller must
    /// inspect the returned [`SnapshotOutcome`] to discover it.
    fn snapshot(
        &self,
        new_path: &Path,
        parent_path: &Path,
        force_link: bool,
    ) -> VhdStoreResult<SnapshotOutcome>;

    /// Merge `path`'s allocated blocks into its parent. `path` itself is
    /// not deleted or truncated by this call.
    fn coalesce(&self, path: &Path) -> VhdStoreResult<()>;

    /// Read the on-disk parent pointer (a path) of `path`.
    fn get_parent(&self, path: &Path) -> VhdStoreResult<String>;

    /// Rewrite the on-disk parent pointer of `path`.
    fn set_parent(&self, path: &Path, parent_path: &Path) -> VhdStoreResult<()>;

    /// Grow the logical size of `path` to `size_mib` MiB.
    fn resize(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()>;

    /// Zero the data region of `path` (leaf reset for non-persistent disks).
    fn reset(&self, path: &Path) -> VhdStoreResult<()>;

    /// True iff no block is allocated in `path`.
    fn is_empty(&self, path: &Path) -> VhdStoreResult<bool>;

    /// Logical size of `path`, in bytes.
    fn get_vsize(&self, path: &Path) -> VhdStoreResult<u64>;

    /// Physical on-disk utilization of `path`, in bytes.
    fn get_psize(&self, path: &Path) -> VhdStoreResult<u64>;
}

impl<X: VhdTool + ?Sized> VhdTool for std::sync::Arc<X> {
    fn create(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()> {
        (**self).create(path, size_mib)
    }

    fn snapshot(&self, new_path: &Path, parent_path: &Path, force_link: bool) -> VhdStoreResult<SnapshotOutcome> {
        (**self).snapshot(new_path, parent_path, force_link)
    }

    fn coalesce(&self, path: &Path) -> VhdStoreResult<()> {
        (**self).coalesce(path)
    }

    fn get_parent(&self, path: &Path) -> VhdStoreResult<String> {
        (**self).get_parent(path)
    }

    fn set_parent(&self, path: &Path, parent_path: &Path) -> VhdStoreResult<()> {
        (**self).set_parent(path, parent_path)
    }

    fn resize(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()> {
        (**self).resize(path, size_mib)
    }

    fn reset(&self, path: &Path) -> VhdStoreResult<()> {
        (**self).reset(path)
    }

    fn is_empty(&self, path: &Path) -> VhdStoreResult<bool> {
        (**self).is_empty(path)
    }

    fn get_vsize(&self, path: &Path) -> VhdStoreResult<u64> {
        (**self).get_vsize(path)
    }

    fn get_psize(&self, path: &Path) -> VhdStoreResult<u64> {
        (**self).get_psize(path)
    }
}

/// Round a byte size up to the nearest whole mebibyte, returning both the
/// MiB count (what `vhd-util` wants) and the exact byte value to persist
/// in the metabase.
pub fn round_up_to_mib(size_bytes: u64) -> (u64, u64) {
    let size_mib = size_bytes.div_ceil(MEBIBYTE).max(1);
    (size_mib, size_mib * MEBIBYTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_exact_mib_is_unchanged() {
        assert_eq!(round_up_to_mib(MEBIBYTE), (1, MEBIBYTE));
    }

    #[test]
    fn round_up_partial_mib_rounds_up() {
        assert_eq!(round_up_to_mib(MEBIBYTE + 1), (2, 2 * MEBIBYTE));
    }

    #[test]
    fn round_up_zero_is_one_mib() {
        assert_eq!(round_up_to_mib(0), (1, MEBIBYTE));
    }
}
