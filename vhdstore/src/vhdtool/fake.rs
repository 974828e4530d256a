//! An in-memory stand-in for `vhd-util`, used by engine/GC unit tests so
//! they never shell out to a real binary. Tracks chain topology and
//! empty/size state the same way a real coalesce test harness stubs
//! these operations rather than invoking the actual tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

use super::{SnapshotOutcome, VhdTool, MEBIBYTE};

#[derive(Debug, Clone)]
struct FakeVhd {
    parent: Option<PathBuf>,
    vsize: u64,
    psize: u64,
    empty: bool,
}

/// Scripted, in-memory `VhdTool`. Mark a VHD non-empty with
/// [`FakeVhdTool::mark_written`] to exercise the parent-empty optimization
/// path in clone tests.
#[derive(Default)]
pub struct FakeVhdTool {
    vhds: Mutex<HashMap<PathBuf, FakeVhd>>,
}

impl FakeVhdTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a guest write: the VHD is no longer empty, so a subsequent
    /// snapshot of it will link directly to it rather than rebasing.
    pub fn mark_written(&self, path: &Path) {
        if let Some(vhd) = self.vhds.lock().get_mut(path) {
            vhd.empty = false;
        }
    }

    pub fn psize(&self, path: &Path) -> Option<u64> {
        self.vhds.lock().get(path).map(|v| v.psize)
    }
}

fn not_found(path: &Path) -> VhdStoreError {
    VhdStoreError::ToolFailure {
        exit_code: Some(1),
        stderr: format!("no such vhd: {}", path.display()),
    }
}

impl VhdTool for FakeVhdTool {
    fn create(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()> {
        self.vhds.lock().insert(
            path.to_path_buf(),
            FakeVhd {
                parent: None,
                vsize: size_mib * MEBIBYTE,
                psize: 0,
                empty: true,
            },
        );
        Ok(())
    }

    fn snapshot(
        &self,
        new_path: &Path,
        parent_path: &Path,
        force_link: bool,
    ) -> VhdStoreResult<SnapshotOutcome> {
        let mut vhds = self.vhds.lock();
        let parent = vhds.get(parent_path).cloned().ok_or_else(|| not_found(parent_path))?;

        // Mirrors vhd-util: an empty, non-force-linked source gets rebased
        // onto its own parent (which may itself be None, i.e. the new VHD
        // becomes parentless). The outcome is then derived the same way
        // ProcessVhdTool derives it: by comparing the resulting link
        // against the snapshotted path, not by re-deriving it from the
        // inputs.
        let new_parent = if !force_link && parent.empty {
            parent.parent.clone()
        } else {
            Some(parent_path.to_path_buf())
        };
        let outcome = if new_parent.as_deref() == Some(parent_path) {
            SnapshotOutcome::LinkedToSource
        } else {
            SnapshotOutcome::LinkedToSourceParent
        };

        vhds.insert(
            new_path.to_path_buf(),
            FakeVhd {
                parent: new_parent,
                vsize: parent.vsize,
                psize: 0,
                empty: true,
            },
        );
        Ok(outcome)
    }

    fn coalesce(&self, path: &Path) -> VhdStoreResult<()> {
        let mut vhds = self.vhds.lock();
        let node = vhds.get(path).cloned().ok_or_else(|| not_found(path))?;
        if let Some(parent_path) = node.parent.clone() {
            if let Some(parent) = vhds.get_mut(&parent_path) {
                parent.psize += node.psize;
                parent.empty = false;
            }
        }
        Ok(())
    }

    fn get_parent(&self, path: &Path) -> VhdStoreResult<String> {
        let vhds = self.vhds.lock();
        let node = vhds.get(path).ok_or_else(|| not_found(path))?;
        Ok(node
            .parent
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default())
    }

    fn set_parent(&self, path: &Path, parent_path: &Path) -> VhdStoreResult<()> {
        let mut vhds = self.vhds.lock();
        let node = vhds.get_mut(path).ok_or_else(|| not_found(path))?;
        node.parent = Some(parent_path.to_path_buf());
        Ok(())
    }

    fn resize(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()> {
        let mut vhds = self.vhds.lock();
        let node = vhds.get_mut(path).ok_or_else(|| not_found(path))?;
        node.vsize = size_mib * MEBIBYTE;
        Ok(())
    }

    fn reset(&self, path: &Path) -> VhdStoreResult<()> {
        let mut vhds = self.vhds.lock();
        let node = vhds.get_mut(path).ok_or_else(|| not_found(path))?;
        node.empty = true;
        node.psize = 0;
        Ok(())
    }

    fn is_empty(&self, path: &Path) -> VhdStoreResult<bool> {
        let vhds = self.vhds.lock();
        let node = vhds.get(path).ok_or_else(|| not_found(path))?;
        Ok(node.empty)
    }

    fn get_vsize(&self, path: &Path) -> VhdStoreResult<u64> {
        let vhds = self.vhds.lock();
        let node = vhds.get(path).ok_or_else(|| not_found(path))?;
        Ok(node.vsize)
    }

    fn get_psize(&self, path: &Path) -> VhdStoreResult<u64> {
        let vhds = self.vhds.lock();
        let node = vhds.get(path).ok_or_else(|| not_found(path))?;
        Ok(node.psize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn snapshot_of_empty_root_rebases_to_none() {
        let tool = FakeVhdTool::new();
        let root = PathBuf::from("/sr/1.vhd");
        let snap = PathBuf::from("/sr/2.vhd");
        tool.create(&root, 10).unwrap();

        let outcome = tool.snapshot(&snap, &root, false).unwrap();
        assert_eq!(outcome, SnapshotOutcome::LinkedToSourceParent);
        assert_eq!(tool.get_parent(&snap).unwrap(), "");
    }

    #[test]
    fn snapshot_of_written_leaf_links_to_leaf() {
        let tool = FakeVhdTool::new();
        let root = PathBuf::from("/sr/1.vhd");
        let snap = PathBuf::from("/sr/2.vhd");
        tool.create(&root, 10).unwrap();
        tool.mark_written(&root);

        let outcome = tool.snapshot(&snap, &root, false).unwrap();
        assert_eq!(outcome, SnapshotOutcome::LinkedToSource);
        assert_eq!(tool.get_parent(&snap).unwrap(), root.display().to_string());
    }
}
