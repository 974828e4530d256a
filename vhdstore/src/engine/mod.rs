//! The volume lifecycle: the operations a storage-manager issues against
//! one VDI at a time. Every method acquires whatever locks its contract
//! calls for, runs its mutations inside one or more
//! [`crate::metabase::WriteContext`]s, and leaves the metabase and on-disk
//! VHD files consistent (or journaled towards consistency) on return.

mod clone;
mod types;

pub use types::VdiDescriptor;

use std::path::PathBuf;

use uuid::Uuid;
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

use crate::datapath::{DatapathRefresh, DatapathUri, FilesystemTap, Tap};
use crate::locks::GLOBAL_LOCK;
use crate::metabase::{Metabase, Vdi, Vhd};
use crate::provider::StorageProvider;
use crate::vhdtool::{round_up_to_mib, VhdTool};

/// Holds one SR's provider, tool, refresh handle and metabase. One
/// instance per process per SR, matching the single-connection-per-process
/// storage model.
pub struct VolumeEngine<P, T, R> {
    provider: P,
    tool: T,
    refresh: R,
    metabase: Metabase,
    tap: FilesystemTap,
}

impl<P: StorageProvider, T: VhdTool, R: DatapathRefresh> VolumeEngine<P, T, R> {
    pub fn new(provider: P, tool: T, refresh: R, metabase: Metabase, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            tool,
            refresh,
            metabase,
            tap: FilesystemTap::new(run_dir),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn metabase(&self) -> &Metabase {
        &self.metabase
    }

    fn vhd_path(&self, id: i64) -> PathBuf {
        self.provider.volume_path(&id.to_string())
    }

    fn require_vdi(&self, uuid: &str) -> VhdStoreResult<Vdi> {
        self.metabase
            .get_vdi_by_uuid(uuid)?
            .ok_or_else(|| VhdStoreError::NotFound(uuid.to_string()))
    }

    fn require_vhd(&self, id: i64) -> VhdStoreResult<Vhd> {
        self.metabase
            .get_vhd_by_id(id)?
            .ok_or_else(|| VhdStoreError::ConsistencyError(format!("vhd {id} referenced but missing")))
    }

    fn descriptor(&self, vdi: &Vdi, vhd: &Vhd) -> VhdStoreResult<VdiDescriptor> {
        let vsize = vhd
            .vsize
            .ok_or_else(|| VhdStoreError::ConsistencyError(format!("vhd {} has no vsize", vhd.id)))?;
        let physical_utilisation = self.provider.volume_phys_size(&vhd.id.to_string()).unwrap_or(0);
        Ok(VdiDescriptor {
            uuid: vdi.uuid.clone(),
            name: vdi.name.clone(),
            description: vdi.description.clone(),
            vsize: vsize as u64,
            physical_utilisation,
            uri: DatapathUri::build(&self.provider.uri_prefix(), &vdi.uuid),
        })
    }

    pub fn create(&mut self, name: &str, description: &str, size_bytes: u64) -> VhdStoreResult<VdiDescriptor> {
        let (size_mib, size_bytes) = round_up_to_mib(size_bytes);
        let uuid = Uuid::new_v4().to_string();

        let wctx = self.metabase.write_context()?;
        let vhd = wctx.insert_new_vhd(size_bytes as i64)?;
        wctx.insert_vdi(&uuid, name, description, vhd.id)?;
        wctx.commit()?;

        let path = self.provider.volume_create(&vhd.id.to_string(), size_bytes)?;
        self.tool.create(&path, size_mib)?;

        let vdi = self.require_vdi(&uuid)?;
        self.descriptor(&vdi, &vhd)
    }

    /// Two transactions, deliberately: the VDI delete commits before the
    /// file is removed, so a crash in between leaves a VHD with no
    /// referencing VDI and no children — garbage the next GC sweep
    /// reclaims, never a dangling VDI.
    pub fn destroy(&mut self, uuid: &str) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let vdi = self.require_vdi(uuid)?;

        let wctx = self.metabase.write_context()?;
        wctx.delete_vdi(uuid)?;
        wctx.commit()?;

        self.provider.volume_destroy(&vdi.vhd_id.to_string())?;

        let wctx = self.metabase.write_context()?;
        wctx.delete_vhd(vdi.vhd_id)?;
        wctx.commit()
    }

    /// Clears `vsize` before touching anything else so a crash mid-resize
    /// is detectable by the NULL it leaves behind.
    pub fn resize(&mut self, uuid: &str, new_size: u64) -> VhdStoreResult<()> {
        let (size_mib, size_bytes) = round_up_to_mib(new_size);
        let vdi = self.require_vdi(uuid)?;

        let wctx = self.metabase.write_context()?;
        wctx.update_vhd_vsize(vdi.vhd_id, None)?;
        wctx.commit()?;

        let path = self.vhd_path(vdi.vhd_id);
        self.provider.volume_resize(&vdi.vhd_id.to_string(), size_bytes)?;
        self.tool.resize(&path, size_mib)?;

        let wctx = self.metabase.write_context()?;
        wctx.update_vhd_vsize(vdi.vhd_id, Some(size_bytes as i64))?;
        wctx.commit()
    }

    pub fn stat(&mut self, uuid: &str) -> VhdStoreResult<VdiDescriptor> {
        let vdi = self.require_vdi(uuid)?;
        let vhd = self.repair_vsize(vdi.vhd_id)?;
        self.descriptor(&vdi, &vhd)
    }

    pub fn ls(&mut self) -> VhdStoreResult<Vec<VdiDescriptor>> {
        let vdis = self.metabase.get_all_vdis()?;
        let mut out = Vec::with_capacity(vdis.len());
        for vdi in vdis {
            let vhd = self.repair_vsize(vdi.vhd_id)?;
            out.push(self.descriptor(&vdi, &vhd)?);
        }
        Ok(out)
    }

    /// A NULL `vsize` means a crash landed between the two halves of a
    /// resize; recover by re-querying the tool and writing the value back.
    fn repair_vsize(&mut self, vhd_id: i64) -> VhdStoreResult<Vhd> {
        let vhd = self.require_vhd(vhd_id)?;
        if vhd.vsize.is_some() {
            return Ok(vhd);
        }
        let path = self.vhd_path(vhd_id);
        let vsize = self.tool.get_vsize(&path)?;

        let wctx = self.metabase.write_context()?;
        wctx.update_vhd_vsize(vhd_id, Some(vsize as i64))?;
        wctx.commit()?;

        Ok(Vhd {
            vsize: Some(vsize as i64),
            ..vhd
        })
    }

    pub fn set_name(&mut self, uuid: &str, name: &str) -> VhdStoreResult<()> {
        let wctx = self.metabase.write_context()?;
        wctx.update_vdi_name(uuid, name)?;
        wctx.commit()
    }

    pub fn set_description(&mut self, uuid: &str, description: &str) -> VhdStoreResult<()> {
        let wctx = self.metabase.write_context()?;
        wctx.update_vdi_description(uuid, description)?;
        wctx.commit()
    }

    /// Retained for interface completeness: the storage-manager contract
    /// lists `set`/`unset` as volume operations but gives them no defined
    /// behavior for a VHD-backed volume.
    pub fn set(&mut self, _uuid: &str, _key: &str, _value: &str) -> VhdStoreResult<()> {
        Ok(())
    }

    pub fn unset(&mut self, _uuid: &str, _key: &str) -> VhdStoreResult<()> {
        Ok(())
    }

    /// Total physical utilization locked up in interior (non-leaf) nodes —
    /// capacity an operator can expect a coalesce pass to eventually free.
    pub fn get_sr_provisioned_size(&self) -> VhdStoreResult<u64> {
        Ok(self.metabase.get_non_leaf_total_psize()? as u64)
    }

    pub fn attach(&mut self, uuid: &str) -> VhdStoreResult<PathBuf> {
        let vdi = self.require_vdi(uuid)?;
        let path = self.vhd_path(vdi.vhd_id);
        self.tap.create(&path)?;
        Ok(path)
    }

    pub fn activate(&mut self, uuid: &str, host: &str) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let vdi = self.require_vdi(uuid)?;
        let path = self.vhd_path(vdi.vhd_id);
        let handle = self.tap.create(&path)?;
        self.tap.open(&handle, &path)?;

        let wctx = self.metabase.write_context()?;
        wctx.update_vdi_active_on(uuid, Some(host))?;
        wctx.commit()
    }

    pub fn deactivate(&mut self, uuid: &str) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let vdi = self.require_vdi(uuid)?;
        let path = self.vhd_path(vdi.vhd_id);
        if let Some(handle) = self.tap.load(&path)? {
            self.tap.close(&handle)?;
        }

        let wctx = self.metabase.write_context()?;
        wctx.update_vdi_active_on(uuid, None)?;
        wctx.commit()
    }

    pub fn detach(&mut self, uuid: &str) -> VhdStoreResult<()> {
        let vdi = self.require_vdi(uuid)?;
        let path = self.vhd_path(vdi.vhd_id);
        if let Some(handle) = self.tap.load(&path)? {
            self.tap.destroy(&handle)?;
        }
        Ok(())
    }

    /// A persistent open of a previously non-persistent leaf resets and
    /// clears the flag; a repeated non-persistent open just resets; a
    /// first non-persistent open marks the flag and, if the leaf already
    /// holds data, would normally kick off a single-clone — see
    /// [`Self::todo_create_single_clone`].
    pub fn epoch_open(&mut self, uuid: &str, persistent: bool) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let vdi = self.require_vdi(uuid)?;
        let path = self.vhd_path(vdi.vhd_id);

        if persistent {
            if vdi.nonpersistent {
                self.tool.reset(&path)?;
                let wctx = self.metabase.write_context()?;
                wctx.update_vdi_nonpersistent(uuid, false)?;
                wctx.commit()?;
            }
            return Ok(());
        }

        if vdi.nonpersistent {
            return self.tool.reset(&path);
        }

        let wctx = self.metabase.write_context()?;
        wctx.update_vdi_nonpersistent(uuid, true)?;
        wctx.commit()?;

        if !self.tool.is_empty(&path)? {
            self.todo_create_single_clone(uuid)?;
        }
        Ok(())
    }

    pub fn epoch_close(&mut self, uuid: &str) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let vdi = self.require_vdi(uuid)?;
        if !vdi.nonpersistent {
            return Ok(());
        }

        let path = self.vhd_path(vdi.vhd_id);
        self.tool.reset(&path)?;

        let wctx = self.metabase.write_context()?;
        wctx.update_vdi_nonpersistent(uuid, false)?;
        wctx.commit()
    }

    /// The non-persistent, non-empty epoch-open path has no recoverable
    /// intent to port, so it stays an explicit, named failure rather than
    /// an invented behavior.
    fn todo_create_single_clone(&mut self, _uuid: &str) -> VhdStoreResult<()> {
        Err(VhdStoreError::Internal(
            "create_single_clone has no defined semantics; not implemented".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::NullRefresh;
    use crate::provider::OperationMode;
    use crate::vhdtool::FakeVhdTool;
    use std::time::Duration;
    use tempfile::TempDir;

    fn new_engine(dir: &TempDir) -> VolumeEngine<FilesystemProvider, FakeVhdTool, NullRefresh> {
        let provider = FilesystemProvider::open(dir.path().join("sr"), OperationMode::ReadWrite).unwrap();
        let metabase = Metabase::open(&dir.path().join("sr").join("sqlite3-metadata.db"), Duration::from_millis(500)).unwrap();
        VolumeEngine::new(provider, FakeVhdTool::new(), NullRefresh, metabase, dir.path().join("run"))
    }

    use crate::provider::FilesystemProvider;

    #[test]
    fn create_then_stat_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);

        let created = engine.create("disk one", "desc", 64 * 1024 * 1024).unwrap();
        let stated = engine.stat(&created.uuid).unwrap();

        assert_eq!(stated.vsize, 64 * 1024 * 1024);
        assert_eq!(stated.name, "disk one");
        assert_eq!(stated.description, "desc");
    }

    #[test]
    fn resize_rounds_up_to_mib() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);
        let created = engine.create("d", "", 1).unwrap();

        engine.resize(&created.uuid, 10 * 1024 * 1024 + 1).unwrap();
        let stated = engine.stat(&created.uuid).unwrap();
        assert_eq!(stated.vsize, 11 * 1024 * 1024);
    }

    #[test]
    fn destroy_twice_is_not_found_second_time() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);
        let created = engine.create("d", "", 1).unwrap();

        engine.destroy(&created.uuid).unwrap();
        let err = engine.destroy(&created.uuid).unwrap_err();
        assert!(matches!(err, VhdStoreError::NotFound(_)));
    }

    #[test]
    fn ls_lists_every_created_vdi() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);
        engine.create("a", "", 1).unwrap();
        engine.create("b", "", 1).unwrap();

        assert_eq!(engine.ls().unwrap().len(), 2);
    }

    #[test]
    fn epoch_close_on_nonpersistent_resets_leaf() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);
        let created = engine.create("d", "", 1).unwrap();

        engine.epoch_open(&created.uuid, false).unwrap();
        engine.epoch_close(&created.uuid).unwrap();

        let vdi = engine.require_vdi(&created.uuid).unwrap();
        assert!(!vdi.nonpersistent);
    }

    #[test]
    fn epoch_open_persistent_on_already_persistent_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);
        let created = engine.create("d", "", 1).unwrap();
        engine.epoch_open(&created.uuid, true).unwrap();
        let vdi = engine.require_vdi(&created.uuid).unwrap();
        assert!(!vdi.nonpersistent);
    }
}
