//! The coalesce daemon: one per SR. Shrinks interior nodes of the VHD
//! chain back down once clones have lengthened it, and reclaims whatever a
//! crashed destroy or a finished coalesce left lying around.
//!
//! The garbage sweep, candidate selection, coalesce, and reparent steps
//! each reacquire the global lock rather than holding it throughout, so
//! the lock is free for the duration of the (potentially very long)
//! `vhd-util coalesce` subprocess call.

mod control;

pub use control::{is_running, mark_exited, start_gc, stop_gc};

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use vhdstore_shared::{VhdStoreError, VhdStoreResult};

use crate::datapath::DatapathRefresh;
use crate::locks::{vhd_lock_name, LockGuard, GLOBAL_LOCK};
use crate::metabase::{Metabase, Refresh, Vhd};
use crate::provider::StorageProvider;
use crate::vhdtool::VhdTool;

/// Ceiling on how long one empty polling pass waits before the main loop
/// calls [`CoalesceDaemon::run_one_iteration`] again.
const MAX_SLEEP: Duration = Duration::from_secs(30);
/// Slice size the sleep is broken into, so `stop_gc` is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_secs(3);

pub struct CoalesceDaemon<P, T, R> {
    provider: P,
    tool: T,
    refresh: R,
    metabase: Metabase,
}

impl<P: StorageProvider, T: VhdTool, R: DatapathRefresh> CoalesceDaemon<P, T, R> {
    pub fn new(provider: P, tool: T, refresh: R, metabase: Metabase) -> Self {
        Self {
            provider,
            tool,
            refresh,
            metabase,
        }
    }

    fn vhd_path(&self, id: i64) -> PathBuf {
        self.provider.volume_path(&id.to_string())
    }

    /// One garbage-sweep → select → coalesce → reparent → delete pass.
    /// Returns whether any work was actually performed, so the caller
    /// knows whether to sleep before trying again.
    pub fn run_one_iteration(&mut self) -> VhdStoreResult<bool> {
        let swept = self.sweep_garbage()?;

        let Some((node, parent, node_lock, parent_lock)) = self.select_candidate()? else {
            return Ok(swept > 0);
        };

        let result = self.coalesce_selected(&node, &parent);

        // Release in the order the design lists: the node first, then its
        // parent. A failed coalesce still frees both locks here so the
        // node can be retried on a later iteration.
        drop(node_lock);
        drop(parent_lock);
        result?;

        Ok(true)
    }

    fn coalesce_selected(&mut self, node: &Vhd, parent: &Vhd) -> VhdStoreResult<()> {
        self.tool.coalesce(&self.vhd_path(node.id))?;
        self.reparent_grandchildren(node, parent)?;
        self.delete_node(node)
    }

    fn sweep_garbage(&mut self) -> VhdStoreResult<usize> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let garbage = self.metabase.get_garbage_vhds()?;
        for vhd in &garbage {
            self.provider.volume_destroy(&vhd.id.to_string())?;
            let wctx = self.metabase.write_context()?;
            wctx.delete_vhd(vhd.id)?;
            wctx.commit()?;
        }
        Ok(garbage.len())
    }

    /// Holds the global lock only long enough to pick a candidate and its
    /// fine-grained locks; the caller releases the global lock before
    /// starting the actual (long-running) coalesce.
    fn select_candidate(&mut self) -> VhdStoreResult<Option<(Vhd, Vhd, LockGuard, LockGuard)>> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        for node in self.metabase.find_non_leaf_coalesceable()? {
            let Some(parent_id) = node.parent_id else {
                continue;
            };
            let Some(parent_lock) = self.provider.try_lock(&vhd_lock_name(parent_id))? else {
                continue;
            };
            let Some(node_lock) = self.provider.try_lock(&vhd_lock_name(node.id))? else {
                drop(parent_lock);
                continue;
            };
            let parent = self.metabase.get_vhd_by_id(parent_id)?.ok_or_else(|| {
                VhdStoreError::ConsistencyError(format!("vhd {parent_id} referenced but missing"))
            })?;
            return Ok(Some((node, parent, node_lock, parent_lock)));
        }
        Ok(None)
    }

    fn reparent_grandchildren(&mut self, node: &Vhd, parent: &Vhd) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        let children = self.metabase.get_children(node.id)?;
        let child_ids: Vec<i64> = children.iter().map(|c| c.id).collect();

        let wctx = self.metabase.write_context()?;
        wctx.add_journal_entries(node.id, parent.id, &child_ids)?;
        wctx.commit()?;

        for child in &children {
            self.reparent_one_child(parent, child)?;
        }
        Ok(())
    }

    fn reparent_one_child(&mut self, parent: &Vhd, child: &Vhd) -> VhdStoreResult<()> {
        let leaves = self.metabase.find_live_leaves_under(child.id)?;
        let leaf_ids: Vec<i64> = leaves.iter().map(|l| l.id).collect();

        let wctx = self.metabase.write_context()?;
        wctx.add_refresh_entries(child.id, &leaf_ids)?;
        wctx.commit()?;

        let child_path = self.vhd_path(child.id);
        let parent_path = self.vhd_path(parent.id);

        let wctx = self.metabase.write_context()?;
        wctx.update_vhd_parent_id(child.id, Some(parent.id))?;
        wctx.commit()?;

        self.tool.set_parent(&child_path, &parent_path)?;

        let wctx = self.metabase.write_context()?;
        wctx.remove_journal_entry(child.id)?;
        wctx.commit()?;

        for refresh in self.metabase.get_refresh_entries()? {
            if refresh.vhd_id == child.id {
                self.issue_refresh(&refresh)?;
            }
        }
        Ok(())
    }

    /// Tells the leaf's active host to re-open its tap. The leaf's own
    /// path never moves during a reparent — only an ancestor does — so
    /// old and new path are both the leaf's own path; this is what tells
    /// the host to re-read the (now repointed) chain underneath it rather
    /// than pick up a stale open.
    fn issue_refresh(&mut self, refresh: &Refresh) -> VhdStoreResult<()> {
        if let Some(vdi) = self.metabase.get_vdi_for_vhd(refresh.leaf_id)? {
            if let Some(host) = vdi.active_on {
                let leaf_path = self.vhd_path(refresh.leaf_id);
                self.refresh.refresh(&host, &leaf_path, &leaf_path)?;
            }
        }
        let wctx = self.metabase.write_context()?;
        wctx.remove_refresh_entry(refresh.leaf_id)?;
        wctx.commit()
    }

    fn delete_node(&mut self, node: &Vhd) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;
        self.provider.volume_destroy(&node.id.to_string())?;
        let wctx = self.metabase.write_context()?;
        wctx.delete_vhd(node.id)?;
        wctx.commit()
    }

    /// Crash-recovery pass, run once before the main loop starts: for every
    /// outstanding journal row, rewrite the on-disk parent pointer if it
    /// hasn't happened yet and finish the metabase update; for every
    /// outstanding refresh row, reissue the refresh. A reparenting is
    /// complete exactly when the metabase, the on-disk header, and the
    /// absence of a journal row all agree.
    pub fn recover(&mut self) -> VhdStoreResult<()> {
        let _gl = self.provider.lock(GLOBAL_LOCK)?;

        for journal in self.metabase.get_journal_entries()? {
            let child_path = self.vhd_path(journal.id);
            let old_parent_path = self.vhd_path(journal.parent_id);
            let new_parent_path = self.vhd_path(journal.new_parent_id);

            let on_disk_parent = self.tool.get_parent(&child_path)?;
            if on_disk_parent == old_parent_path.display().to_string() {
                self.tool.set_parent(&child_path, &new_parent_path)?;
            }

            let wctx = self.metabase.write_context()?;
            wctx.update_vhd_parent_id(journal.id, Some(journal.new_parent_id))?;
            wctx.remove_journal_entry(journal.id)?;
            wctx.commit()?;
        }

        for refresh in self.metabase.get_refresh_entries()? {
            self.recover_one_refresh(&refresh)?;
        }

        Ok(())
    }

    fn recover_one_refresh(&mut self, refresh: &Refresh) -> VhdStoreResult<()> {
        if let Some(vdi) = self.metabase.get_vdi_for_vhd(refresh.leaf_id)? {
            if let Some(host) = vdi.active_on {
                let leaf_path = self.vhd_path(refresh.leaf_id);
                self.refresh.refresh(&host, &leaf_path, &leaf_path)?;
            }
        }
        let wctx = self.metabase.write_context()?;
        wctx.remove_refresh_entry(refresh.leaf_id)?;
        wctx.commit()
    }

    /// Sleeps up to [`MAX_SLEEP`], in [`SLEEP_SLICE`] increments, returning
    /// early the moment `still_running` reports false.
    pub fn sleep_until_woken(still_running: impl Fn() -> bool) {
        let mut waited = Duration::ZERO;
        while waited < MAX_SLEEP && still_running() {
            thread::sleep(SLEEP_SLICE);
            waited += SLEEP_SLICE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{LoggingRefresh, NullRefresh};
    use crate::engine::VolumeEngine;
    use crate::provider::{FilesystemProvider, OperationMode};
    use crate::vhdtool::FakeVhdTool;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_provider(dir: &TempDir) -> FilesystemProvider {
        FilesystemProvider::open(dir.path().join("sr"), OperationMode::ReadWrite).unwrap()
    }

    fn open_metabase(dir: &TempDir) -> Metabase {
        Metabase::open(&dir.path().join("sr").join("sqlite3-metadata.db"), Duration::from_millis(500)).unwrap()
    }

    /// Builds the `1 <- 2 <- 4` topology with a held snapshot `3` off `1`,
    /// matching the scenario in the design notes: clone `U1` twice with
    /// writes between, then drop the VDI that was pinning `3`.
    fn build_linear_chain_with_extra_snapshot(
        dir: &TempDir,
        tool: Arc<FakeVhdTool>,
    ) -> (VolumeEngine<FilesystemProvider, Arc<FakeVhdTool>, NullRefresh>, String) {
        let mut engine = VolumeEngine::new(
            open_provider(dir),
            tool.clone(),
            NullRefresh,
            open_metabase(dir),
            dir.path().join("run"),
        );

        let u1 = engine.create("disk", "", 64 * 1024 * 1024).unwrap();
        let v1 = engine.metabase().get_vdi_by_uuid(&u1.uuid).unwrap().unwrap().vhd_id;
        tool.mark_written(&engine.provider().volume_path(&v1.to_string()));

        let extra = engine.clone(&u1.uuid).unwrap();
        let v2 = engine.metabase().get_vdi_by_uuid(&u1.uuid).unwrap().unwrap().vhd_id;
        tool.mark_written(&engine.provider().volume_path(&v2.to_string()));

        engine.clone(&u1.uuid).unwrap();
        engine.destroy(&extra.uuid).unwrap();

        (engine, u1.uuid)
    }

    #[test]
    fn run_one_iteration_on_clean_sr_does_no_work() {
        let dir = TempDir::new().unwrap();
        let mut engine = VolumeEngine::new(
            open_provider(&dir),
            FakeVhdTool::new(),
            NullRefresh,
            open_metabase(&dir),
            dir.path().join("run"),
        );
        engine.create("disk", "", 1).unwrap();
        drop(engine);

        let mut daemon = CoalesceDaemon::new(
            open_provider(&dir),
            FakeVhdTool::new(),
            NullRefresh,
            open_metabase(&dir),
        );
        assert!(!daemon.run_one_iteration().unwrap());
    }

    #[test]
    fn sweep_reclaims_orphaned_vhd_row_and_file() {
        let dir = TempDir::new().unwrap();
        let provider = open_provider(&dir);
        let mut metabase = open_metabase(&dir);
        let wctx = metabase.write_context().unwrap();
        let orphan = wctx.insert_new_vhd(1).unwrap();
        wctx.commit().unwrap();
        provider.volume_create(&orphan.id.to_string(), 1).unwrap();
        assert!(provider.volume_path(&orphan.id.to_string()).exists());

        let mut daemon = CoalesceDaemon::new(open_provider(&dir), FakeVhdTool::new(), NullRefresh, metabase);
        assert!(daemon.run_one_iteration().unwrap());
        assert!(daemon.metabase.get_garbage_vhds().unwrap().is_empty());
        assert!(!provider.volume_path(&orphan.id.to_string()).exists());
    }

    #[test]
    fn coalesce_collapses_unique_child_and_reparents_grandchild() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(FakeVhdTool::new());
        let (engine, u1_uuid) = build_linear_chain_with_extra_snapshot(&dir, tool.clone());
        let leaf_vhd_id = engine.metabase().get_vdi_by_uuid(&u1_uuid).unwrap().unwrap().vhd_id;
        drop(engine);

        let mut daemon = CoalesceDaemon::new(open_provider(&dir), tool.clone(), NullRefresh, open_metabase(&dir));
        assert!(daemon.run_one_iteration().unwrap());

        let leaf = daemon.metabase.get_vhd_by_id(leaf_vhd_id).unwrap().unwrap();
        let root = daemon.metabase.get_vhd_by_id(leaf.parent_id.unwrap()).unwrap();
        assert!(root.is_some(), "root must survive the coalesce");
        assert!(daemon.metabase.get_journal_entries().unwrap().is_empty());
        assert!(daemon.metabase.get_refresh_entries().unwrap().is_empty());
    }

    #[test]
    fn coalesce_of_active_leaf_issues_one_refresh() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(FakeVhdTool::new());
        let (mut engine, u1_uuid) = build_linear_chain_with_extra_snapshot(&dir, tool.clone());
        engine.activate(&u1_uuid, "host-a").unwrap();
        let leaf_vhd_id = engine.metabase().get_vdi_by_uuid(&u1_uuid).unwrap().unwrap().vhd_id;
        let leaf_path = engine.provider().volume_path(&leaf_vhd_id.to_string());
        drop(engine);

        let refresh = Arc::new(LoggingRefresh::new());
        struct ArcRefresh(Arc<LoggingRefresh>);
        impl DatapathRefresh for ArcRefresh {
            fn refresh(&self, host: &str, old: &std::path::Path, new: &std::path::Path) -> VhdStoreResult<()> {
                self.0.refresh(host, old, new)
            }
        }

        let mut daemon = CoalesceDaemon::new(open_provider(&dir), tool, ArcRefresh(refresh.clone()), open_metabase(&dir));
        assert!(daemon.run_one_iteration().unwrap());

        let calls = refresh.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "host-a");
        // The leaf's own path never moves during a reparent — only its
        // ancestor does — so both old and new path must be the leaf's
        // own, unchanged path.
        assert_eq!(calls[0].old_path, leaf_path);
        assert_eq!(calls[0].new_path, leaf_path);
    }

    #[test]
    fn recover_reapplies_pending_journal_entry() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(FakeVhdTool::new());
        let provider = open_provider(&dir);
        let mut metabase = open_metabase(&dir);

        let wctx = metabase.write_context().unwrap();
        let root = wctx.insert_new_vhd(10).unwrap();
        let mid = wctx.insert_child_vhd(Some(root.id), 10).unwrap();
        let grandchild = wctx.insert_child_vhd(Some(mid.id), 10).unwrap();
        wctx.insert_vdi("U1", "", "", grandchild.id).unwrap();
        wctx.add_journal_entries(mid.id, root.id, &[grandchild.id]).unwrap();
        wctx.commit().unwrap();

        tool.create(&provider.volume_path(&root.id.to_string()), 10).unwrap();
        tool.create(&provider.volume_path(&mid.id.to_string()), 10).unwrap();
        tool.create(&provider.volume_path(&grandchild.id.to_string()), 10).unwrap();
        tool.set_parent(
            &provider.volume_path(&grandchild.id.to_string()),
            &provider.volume_path(&mid.id.to_string()),
        )
        .unwrap();

        let mut daemon = CoalesceDaemon::new(provider, tool.clone(), NullRefresh, metabase);
        daemon.recover().unwrap();

        assert!(daemon.metabase.get_journal_entries().unwrap().is_empty());
        let updated = daemon.metabase.get_vhd_by_id(grandchild.id).unwrap().unwrap();
        assert_eq!(updated.parent_id, Some(root.id));
        assert_eq!(
            tool.get_parent(&daemon.vhd_path(grandchild.id)).unwrap(),
            daemon.vhd_path(root.id).display().to_string()
        );
    }

    #[test]
    fn recover_reissues_pending_refresh_against_the_leafs_own_path() {
        let dir = TempDir::new().unwrap();
        let provider = open_provider(&dir);
        let mut metabase = open_metabase(&dir);

        let wctx = metabase.write_context().unwrap();
        let root = wctx.insert_new_vhd(10).unwrap();
        let child = wctx.insert_child_vhd(Some(root.id), 10).unwrap();
        wctx.insert_vdi("U1", "", "", child.id).unwrap();
        wctx.update_vdi_active_on("U1", Some("host-a")).unwrap();
        wctx.add_refresh_entries(child.id, &[child.id]).unwrap();
        wctx.commit().unwrap();

        let leaf_path = provider.volume_path(&child.id.to_string());

        let refresh = Arc::new(LoggingRefresh::new());
        struct ArcRefresh(Arc<LoggingRefresh>);
        impl DatapathRefresh for ArcRefresh {
            fn refresh(&self, host: &str, old: &std::path::Path, new: &std::path::Path) -> VhdStoreResult<()> {
                self.0.refresh(host, old, new)
            }
        }

        let mut daemon = CoalesceDaemon::new(provider, FakeVhdTool::new(), ArcRefresh(refresh.clone()), metabase);
        daemon.recover().unwrap();

        assert!(daemon.metabase.get_refresh_entries().unwrap().is_empty());
        let calls = refresh.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "host-a");
        assert_eq!(calls[0].old_path, leaf_path);
        assert_eq!(calls[0].new_path, leaf_path);
    }
}
