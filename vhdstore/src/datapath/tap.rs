//! A per-host tap agent: tap state is a small JSON sidecar file keyed by
//! the VHD path, not an in-memory registry, so it survives the host-local
//! agent restarting.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TapHandle {
    pub image_path: PathBuf,
    pub minor: u32,
}

pub trait Tap: Send + Sync {
    fn create(&self, vhd_path: &Path) -> VhdStoreResult<TapHandle>;
    fn open(&self, handle: &TapHandle, image_path: &Path) -> VhdStoreResult<()>;
    fn close(&self, handle: &TapHandle) -> VhdStoreResult<()>;
    fn destroy(&self, handle: &TapHandle) -> VhdStoreResult<()>;
}

fn sanitize(path: &Path) -> String {
    path.display().to_string().replace(['/', '\\'], "_")
}

/// Persists tap metadata under `<run_dir>/dp-tapdisk/<sanitized-path>/meta`.
pub struct FilesystemTap {
    run_dir: PathBuf,
}

impl FilesystemTap {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self { run_dir: run_dir.into() }
    }

    fn meta_path(&self, vhd_path: &Path) -> PathBuf {
        self.run_dir.join("dp-tapdisk").join(sanitize(vhd_path)).join("meta")
    }

    fn save(&self, vhd_path: &Path, handle: &TapHandle) -> VhdStoreResult<()> {
        let path = self.meta_path(vhd_path);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(handle)
            .map_err(|e| VhdStoreError::Internal(format!("encoding tap metadata: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read back previously-saved tap metadata for `vhd_path`, if any.
    pub fn load(&self, vhd_path: &Path) -> VhdStoreResult<Option<TapHandle>> {
        match fs::read(self.meta_path(vhd_path)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| VhdStoreError::Internal(format!("decoding tap metadata: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Tap for FilesystemTap {
    fn create(&self, vhd_path: &Path) -> VhdStoreResult<TapHandle> {
        let handle = TapHandle {
            image_path: vhd_path.to_path_buf(),
            minor: 0,
        };
        self.save(vhd_path, &handle)?;
        Ok(handle)
    }

    fn open(&self, handle: &TapHandle, image_path: &Path) -> VhdStoreResult<()> {
        let mut updated = handle.clone();
        updated.image_path = image_path.to_path_buf();
        self.save(image_path, &updated)
    }

    fn close(&self, _handle: &TapHandle) -> VhdStoreResult<()> {
        Ok(())
    }

    fn destroy(&self, handle: &TapHandle) -> VhdStoreResult<()> {
        let path = self.meta_path(&handle.image_path);
        if let Some(dir) = path.parent() {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let tap = FilesystemTap::new(dir.path());
        let vhd_path = PathBuf::from("/sr/1.vhd");

        let handle = tap.create(&vhd_path).unwrap();
        let loaded = tap.load(&vhd_path).unwrap().unwrap();
        assert_eq!(handle, loaded);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let tap = FilesystemTap::new(dir.path());
        assert!(tap.load(Path::new("/sr/nope.vhd")).unwrap().is_none());
    }

    #[test]
    fn destroy_removes_metadata() {
        let dir = TempDir::new().unwrap();
        let tap = FilesystemTap::new(dir.path());
        let vhd_path = PathBuf::from("/sr/1.vhd");
        let handle = tap.create(&vhd_path).unwrap();

        tap.destroy(&handle).unwrap();
        assert!(tap.load(&vhd_path).unwrap().is_none());
    }
}
