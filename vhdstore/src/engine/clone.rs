//! The central algorithm: clone a VDI's current leaf.
//!
//! `tool.snapshot` always differences the new VHD `S` against the current
//! leaf `V`, but if `V` holds no data, the tool quietly rebases `S` onto
//! `V`'s own parent instead (the parent-empty optimization) — collapsing
//! what would otherwise be a wasted intermediate node. The engine detects
//! which of the two happened from the tool's reported outcome and reacts
//! accordingly: in the common empty-leaf case, `S` simply becomes a new
//! independent VDI; when `V` actually holds data, an extra snapshot is cut
//! so that both siblings end up branching from a shared, now-read-only
//! parent.

use uuid::Uuid;
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

use crate::datapath::DatapathRefresh;
use crate::locks::GLOBAL_LOCK;
use crate::provider::StorageProvider;
use crate::vhdtool::{SnapshotOutcome, VhdTool};

use super::types::VdiDescriptor;
use super::VolumeEngine;

impl<P: StorageProvider, T: VhdTool, R: DatapathRefresh> VolumeEngine<P, T, R> {
    pub fn clone(&mut self, uuid: &str) -> VhdStoreResult<VdiDescriptor> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;

        let vdi = self.require_vdi(uuid)?;
        let v = self.require_vhd(vdi.vhd_id)?;
        let v_vsize = v
            .vsize
            .ok_or_else(|| VhdStoreError::ConsistencyError(format!("vhd {} has no vsize", v.id)))?;
        let v_path = self.vhd_path(v.id);

        // Step 1: pre-insert S as a sibling of V (V's parent, which may
        // itself be None). This is optimistic: it's only correct if the
        // parent-empty optimization actually fires.
        let wctx = self.metabase.write_context()?;
        let s = wctx.insert_child_vhd(v.parent_id, v_vsize)?;
        wctx.commit()?;

        let s_path = self.provider.volume_create(&s.id.to_string(), v_vsize as u64)?;
        let outcome = self.tool.snapshot(&s_path, &v_path, false)?;

        if outcome == SnapshotOutcome::LinkedToSourceParent {
            // The optimization fired: S is already correctly parented on
            // V's parent. It becomes an independent new VDI; V is
            // untouched, no extra snapshot needed.
            let snapshot_uuid = Uuid::new_v4().to_string();
            let wctx = self.metabase.write_context()?;
            wctx.insert_vdi(&snapshot_uuid, &vdi.name, &vdi.description, s.id)?;
            wctx.commit()?;
            return self.stat(&snapshot_uuid);
        }

        // V was non-empty: S actually links to V, not V's parent. Fix up
        // the pre-insert and repoint the existing VDI at S, which becomes
        // the new leaf under the original uuid. V is now a read-only
        // interior node that will eventually coalesce away. Refresh V's
        // tap (if active) from V to S, record V's observed psize, then cut
        // a second snapshot S2 off V under a fresh uuid — S2 is the
        // caller-visible result of this clone.
        let wctx = self.metabase.write_context()?;
        wctx.update_vhd_parent_id(s.id, Some(v.id))?;
        wctx.update_vdi_vhd_id(uuid, s.id)?;
        wctx.commit()?;

        if let Some(host) = vdi.active_on.clone() {
            self.refresh.refresh(&host, &v_path, &s_path)?;
        }

        let v_psize = self.tool.get_psize(&v_path)?;
        let wctx = self.metabase.write_context()?;
        wctx.update_vhd_psize(v.id, v_psize as i64)?;
        wctx.commit()?;

        let wctx = self.metabase.write_context()?;
        let s2 = wctx.insert_child_vhd(Some(v.id), v_vsize)?;
        wctx.commit()?;

        let s2_path = self.provider.volume_create(&s2.id.to_string(), v_vsize as u64)?;
        self.tool.snapshot(&s2_path, &v_path, false)?;

        let new_uuid = Uuid::new_v4().to_string();
        let wctx = self.metabase.write_context()?;
        wctx.insert_vdi(&new_uuid, &vdi.name, &vdi.description, s2.id)?;
        wctx.commit()?;

        self.stat(&new_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{LoggingRefresh, NullRefresh};
    use crate::metabase::Metabase;
    use crate::provider::{FilesystemProvider, OperationMode};
    use crate::vhdtool::FakeVhdTool;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_metabase(dir: &TempDir) -> Metabase {
        Metabase::open(
            &dir.path().join("sr").join("sqlite3-metadata.db"),
            Duration::from_millis(500),
        )
        .unwrap()
    }

    fn open_provider(dir: &TempDir) -> FilesystemProvider {
        FilesystemProvider::open(dir.path().join("sr"), OperationMode::ReadWrite).unwrap()
    }

    #[test]
    fn clone_of_empty_leaf_creates_one_sibling_vdi() {
        let dir = TempDir::new().unwrap();
        let mut engine = VolumeEngine::new(
            open_provider(&dir),
            Arc::new(FakeVhdTool::new()),
            NullRefresh,
            open_metabase(&dir),
            dir.path().join("run"),
        );

        let u1 = engine.create("disk", "", 64 * 1024 * 1024).unwrap();
        let u2 = engine.clone(&u1.uuid).unwrap();

        assert_ne!(u1.uuid, u2.uuid);
        assert_eq!(engine.ls().unwrap().len(), 2);

        let u1_vdi = engine.require_vdi(&u1.uuid).unwrap();
        let u2_vdi = engine.require_vdi(&u2.uuid).unwrap();
        let u1_vhd = engine.require_vhd(u1_vdi.vhd_id).unwrap();
        let u2_vhd = engine.require_vhd(u2_vdi.vhd_id).unwrap();
        assert_eq!(u1_vhd.parent_id, None);
        assert_eq!(u2_vhd.parent_id, None);
        assert_ne!(u1_vhd.id, u2_vhd.id);
    }

    #[test]
    fn clone_of_written_leaf_produces_two_children_of_old_leaf() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(FakeVhdTool::new());
        let mut engine = VolumeEngine::new(
            open_provider(&dir),
            tool.clone(),
            NullRefresh,
            open_metabase(&dir),
            dir.path().join("run"),
        );

        let u1 = engine.create("disk", "", 100 * 1024 * 1024).unwrap();
        let u1_vdi_before = engine.require_vdi(&u1.uuid).unwrap();
        let v_path = engine.vhd_path(u1_vdi_before.vhd_id);
        tool.mark_written(&v_path);

        let u2 = engine.clone(&u1.uuid).unwrap();

        let u1_vdi_after = engine.require_vdi(&u1.uuid).unwrap();
        let u2_vdi = engine.require_vdi(&u2.uuid).unwrap();

        // U1's leaf moved: it used to point at vhd `v`, now at the second
        // snapshot S2, a new child of `v`.
        assert_ne!(u1_vdi_after.vhd_id, u1_vdi_before.vhd_id);
        let s2 = engine.require_vhd(u1_vdi_after.vhd_id).unwrap();
        assert_eq!(s2.parent_id, Some(u1_vdi_before.vhd_id));

        // U2 (the returned clone descriptor) points at S, the other new
        // child of the old leaf.
        let s = engine.require_vhd(u2_vdi.vhd_id).unwrap();
        assert_eq!(s.parent_id, Some(u1_vdi_before.vhd_id));
        assert_ne!(s.id, s2.id);
    }

    #[test]
    fn clone_of_active_written_leaf_issues_one_refresh() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(FakeVhdTool::new());
        let refresh = Arc::new(LoggingRefresh::new());
        let mut engine = VolumeEngine::new(
            open_provider(&dir),
            tool.clone(),
            ArcRefresh(refresh.clone()),
            open_metabase(&dir),
            dir.path().join("run"),
        );

        let u1 = engine.create("disk", "", 100 * 1024 * 1024).unwrap();
        engine.activate(&u1.uuid, "host-a").unwrap();
        let u1_vdi = engine.require_vdi(&u1.uuid).unwrap();
        let v_path = engine.vhd_path(u1_vdi.vhd_id);
        tool.mark_written(&v_path);

        engine.clone(&u1.uuid).unwrap();

        let calls = refresh.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "host-a");
        assert_eq!(calls[0].old_path, v_path);
    }

    struct ArcRefresh(Arc<LoggingRefresh>);

    impl DatapathRefresh for ArcRefresh {
        fn refresh(&self, host: &str, old_path: &std::path::Path, new_path: &std::path::Path) -> VhdStoreResult<()> {
            self.0.refresh(host, old_path, new_path)
        }
    }
}
