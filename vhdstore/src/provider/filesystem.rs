//! A local-directory-backed [`StorageProvider`]. Stands in for whatever
//! cluster filesystem, iSCSI LUN, or LV-on-shared-block backend is
//! actually mounted in production (deliberately out of scope per the
//! system's stated boundary) while still exercising every operation the
//! engine and GC call through this trait.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

use super::{OperationMode, StorageProvider};
use crate::locks::{self, LockGuard};

pub struct FilesystemProvider {
    root: PathBuf,
    mode: OperationMode,
}

impl FilesystemProvider {
    pub fn open(root: impl Into<PathBuf>, mode: OperationMode) -> VhdStoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("locks"))?;
        Ok(Self { root, mode })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn check_writable(&self) -> VhdStoreResult<()> {
        if self.mode == OperationMode::ReadOnly {
            return Err(VhdStoreError::ProviderFailure(
                "provider opened read-only".to_string(),
            ));
        }
        Ok(())
    }
}

impl StorageProvider for FilesystemProvider {
    fn metadata_path(&self) -> PathBuf {
        self.root.join("sqlite3-metadata.db")
    }

    fn volume_create(&self, name: &str, size_bytes: u64) -> VhdStoreResult<PathBuf> {
        self.check_writable()?;
        let path = self.volume_path(name);
        let _ = size_bytes; // the VHD header reservation is the tool's job
        fs::File::create(&path)?;
        Ok(path)
    }

    fn volume_destroy(&self, name: &str) -> VhdStoreResult<()> {
        self.check_writable()?;
        match fs::remove_file(self.volume_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn volume_rename(&self, old_name: &str, new_name: &str) -> VhdStoreResult<PathBuf> {
        self.check_writable()?;
        let new_path = self.volume_path(new_name);
        fs::rename(self.volume_path(old_name), &new_path)?;
        Ok(new_path)
    }

    fn volume_resize(&self, name: &str, _new_size_bytes: u64) -> VhdStoreResult<()> {
        self.check_writable()?;
        // A directory-backed SR has no separate allocation step the way
        // an LV-backed one would; the VHD tool's own resize does the
        // file-level growth. Still validate the volume exists.
        if !self.volume_path(name).exists() {
            return Err(VhdStoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn volume_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.vhd"))
    }

    fn volume_phys_size(&self, name: &str) -> VhdStoreResult<u64> {
        Ok(fs::metadata(self.volume_path(name))?.len())
    }

    fn uri_prefix(&self) -> String {
        format!("{}|", self.root.display())
    }

    fn unique_id(&self) -> String {
        let canon = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let digest = Sha256::digest(canon.display().to_string().as_bytes());
        hex::encode(digest)
    }

    fn lock(&self, name: &str) -> VhdStoreResult<LockGuard> {
        locks::lock(&self.locks_dir(), name)
    }

    fn try_lock(&self, name: &str) -> VhdStoreResult<Option<LockGuard>> {
        locks::try_lock(&self.locks_dir(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn volume_create_then_path_and_phys_size() {
        let dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::open(dir.path(), OperationMode::ReadWrite).unwrap();
        let path = provider.volume_create("1", 1024).unwrap();
        assert_eq!(path, provider.volume_path("1"));
        assert_eq!(provider.volume_phys_size("1").unwrap(), 0);
    }

    #[test]
    fn read_only_provider_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::open(dir.path(), OperationMode::ReadOnly).unwrap();
        assert!(provider.volume_create("1", 1024).is_err());
    }

    #[test]
    fn unique_id_is_stable_across_instances() {
        let dir = TempDir::new().unwrap();
        let a = FilesystemProvider::open(dir.path(), OperationMode::ReadWrite).unwrap();
        let b = FilesystemProvider::open(dir.path(), OperationMode::ReadWrite).unwrap();
        assert_eq!(a.unique_id(), b.unique_id());
    }

    #[test]
    fn destroy_missing_volume_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::open(dir.path(), OperationMode::ReadWrite).unwrap();
        assert!(provider.volume_destroy("never-created").is_ok());
    }
}
