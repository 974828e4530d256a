//! Per-SR advisory locks, named rather than scoped to an in-memory value:
//! `"gl"` (the SR-wide lock) and one `"vhd-<id>.lock"` per VHD, held only
//! by the coalesce daemon. Backed by `flock(2)` on a reserved file per
//! name, wrapped in an RAII guard that releases on drop instead of a bare
//! fd plus manual unlock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

/// The SR-wide lock name, held for the duration of any chain-topology
/// mutation (destroy, clone, coalesce's critical section, epoch-open/
/// close, activate/deactivate).
pub const GLOBAL_LOCK: &str = "gl";

/// The per-VHD lock name used only by the coalesce daemon.
pub fn vhd_lock_name(id: i64) -> String {
    format!("vhd-{id}.lock")
}

/// An acquired advisory lock; releases on drop.
pub struct LockGuard {
    _flock: Flock<File>,
}

fn lock_file_path(locks_dir: &Path, name: &str) -> PathBuf {
    locks_dir.join(name)
}

fn open_lock_file(path: &Path) -> VhdStoreResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(VhdStoreError::Io)
}

/// Block until `name` is acquired under `locks_dir`.
pub fn lock(locks_dir: &Path, name: &str) -> VhdStoreResult<LockGuard> {
    let path = lock_file_path(locks_dir, name);
    let file = open_lock_file(&path)?;
    let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        VhdStoreError::ProviderFailure(format!("lock {} failed: {errno}", path.display()))
    })?;
    Ok(LockGuard { _flock: flock })
}

/// Acquire `name` under `locks_dir` without blocking. `Ok(None)` means
/// contention, not an error — the try_lock contract returns null on
/// contention rather than failing the caller.
pub fn try_lock(locks_dir: &Path, name: &str) -> VhdStoreResult<Option<LockGuard>> {
    let path = lock_file_path(locks_dir, name);
    let file = open_lock_file(&path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(flock) => Ok(Some(LockGuard { _flock: flock })),
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(VhdStoreError::ProviderFailure(format!(
            "try_lock {} failed: {errno}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_then_try_lock_same_name_fails() {
        let dir = TempDir::new().unwrap();
        let _held = lock(dir.path(), GLOBAL_LOCK).unwrap();
        let contended = try_lock(dir.path(), GLOBAL_LOCK).unwrap();
        assert!(contended.is_none());
    }

    #[test]
    fn lock_released_on_drop_allows_relock() {
        let dir = TempDir::new().unwrap();
        {
            let _held = lock(dir.path(), GLOBAL_LOCK).unwrap();
        }
        let reacquired = try_lock(dir.path(), GLOBAL_LOCK).unwrap();
        assert!(reacquired.is_some());
    }

    #[test]
    fn distinct_vhd_locks_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let _a = lock(dir.path(), &vhd_lock_name(1)).unwrap();
        let b = try_lock(dir.path(), &vhd_lock_name(2)).unwrap();
        assert!(b.is_some());
    }
}
