//! The scoped write transaction. Every mutation method lives here, on
//! [`WriteContext`], rather than on [`super::Metabase`] directly — the
//! type system is the enforcement mechanism for "every mutating call
//! happens inside a write context", not a runtime check.

use rusqlite::{params, OptionalExtension, Transaction};
use vhdstore_shared::VhdStoreResult;

use super::types::{Journal, Refresh, Vhd};

/// A borrowed, deferred write transaction. Obtained from
/// [`super::Metabase::write_context`], which takes `&mut Metabase` — so a
/// second `write_context()` call while this one is still alive is a
/// borrow-checker error, not a runtime race.
///
/// Dropping without calling [`WriteContext::commit`] rolls the transaction
/// back (rusqlite's default `Transaction` drop behavior), which is exactly
/// what an early `?` return from a failed engine operation needs.
pub struct WriteContext<'a> {
    txn: Transaction<'a>,
}

impl<'a> WriteContext<'a> {
    pub(super) fn new(txn: Transaction<'a>) -> Self {
        Self { txn }
    }

    /// Commit the transaction. Call this as the last step of every engine
    /// or GC operation that reached this point without error.
    pub fn commit(self) -> VhdStoreResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn insert_new_vhd(&self, vsize: i64) -> VhdStoreResult<Vhd> {
        self.insert_vhd(None, vsize)
    }

    /// `parent_id` of `None` inserts another root — the node being
    /// snapshotted may itself be parentless, and the clone algorithm
    /// relies on the new sibling inheriting the source's parent whatever
    /// it is.
    pub fn insert_child_vhd(&self, parent_id: Option<i64>, vsize: i64) -> VhdStoreResult<Vhd> {
        self.insert_vhd(parent_id, vsize)
    }

    fn insert_vhd(&self, parent_id: Option<i64>, vsize: i64) -> VhdStoreResult<Vhd> {
        self.txn.execute(
            "INSERT INTO vhd (parent_id, snap, vsize, psize) VALUES (?1, 0, ?2, 0)",
            params![parent_id, vsize],
        )?;
        let id = self.txn.last_insert_rowid();
        Ok(Vhd {
            id,
            parent_id,
            snap: 0,
            vsize: Some(vsize),
            psize: Some(0),
        })
    }

    pub fn insert_vdi(&self, uuid: &str, name: &str, description: &str, vhd_id: i64) -> VhdStoreResult<()> {
        self.txn.execute(
            "INSERT INTO vdi (uuid, name, description, active_on, nonpersistent, vhd_id)
             VALUES (?1, ?2, ?3, NULL, 0, ?4)",
            params![uuid, name, description, vhd_id],
        )?;
        Ok(())
    }

    pub fn delete_vdi(&self, uuid: &str) -> VhdStoreResult<()> {
        self.txn.execute("DELETE FROM vdi WHERE uuid = ?1", params![uuid])?;
        Ok(())
    }

    pub fn update_vdi_vhd_id(&self, uuid: &str, vhd_id: i64) -> VhdStoreResult<()> {
        self.txn
            .execute("UPDATE vdi SET vhd_id = ?1 WHERE uuid = ?2", params![vhd_id, uuid])?;
        Ok(())
    }

    pub fn update_vdi_name(&self, uuid: &str, name: &str) -> VhdStoreResult<()> {
        self.txn
            .execute("UPDATE vdi SET name = ?1 WHERE uuid = ?2", params![name, uuid])?;
        Ok(())
    }

    pub fn update_vdi_description(&self, uuid: &str, description: &str) -> VhdStoreResult<()> {
        self.txn.execute(
            "UPDATE vdi SET description = ?1 WHERE uuid = ?2",
            params![description, uuid],
        )?;
        Ok(())
    }

    pub fn update_vdi_active_on(&self, uuid: &str, active_on: Option<&str>) -> VhdStoreResult<()> {
        self.txn.execute(
            "UPDATE vdi SET active_on = ?1 WHERE uuid = ?2",
            params![active_on, uuid],
        )?;
        Ok(())
    }

    pub fn update_vdi_nonpersistent(&self, uuid: &str, nonpersistent: bool) -> VhdStoreResult<()> {
        self.txn.execute(
            "UPDATE vdi SET nonpersistent = ?1 WHERE uuid = ?2",
            params![nonpersistent as i64, uuid],
        )?;
        Ok(())
    }

    pub fn update_vhd_parent_id(&self, id: i64, parent_id: Option<i64>) -> VhdStoreResult<()> {
        self.txn.execute(
            "UPDATE vhd SET parent_id = ?1 WHERE id = ?2",
            params![parent_id, id],
        )?;
        Ok(())
    }

    /// Set to `None` as the first step of a resize, making a crash between
    /// the clear and the rewrite detectable on the next read.
    pub fn update_vhd_vsize(&self, id: i64, vsize: Option<i64>) -> VhdStoreResult<()> {
        self.txn
            .execute("UPDATE vhd SET vsize = ?1 WHERE id = ?2", params![vsize, id])?;
        Ok(())
    }

    pub fn update_vhd_psize(&self, id: i64, psize: i64) -> VhdStoreResult<()> {
        self.txn
            .execute("UPDATE vhd SET psize = ?1 WHERE id = ?2", params![psize, id])?;
        Ok(())
    }

    pub fn delete_vhd(&self, id: i64) -> VhdStoreResult<()> {
        self.txn.execute("DELETE FROM vhd WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Journal every `children` of `parent_id` as mid-reparent to
    /// `new_parent_id`. Must be written before any child's on-disk parent
    /// pointer changes.
    pub fn add_journal_entries(
        &self,
        parent_id: i64,
        new_parent_id: i64,
        children: &[i64],
    ) -> VhdStoreResult<Vec<Journal>> {
        let mut out = Vec::with_capacity(children.len());
        for &child_id in children {
            self.txn.execute(
                "INSERT INTO journal (id, parent_id, new_parent_id) VALUES (?1, ?2, ?3)",
                params![child_id, parent_id, new_parent_id],
            )?;
            out.push(Journal {
                id: child_id,
                parent_id,
                new_parent_id,
            });
        }
        Ok(out)
    }

    pub fn remove_journal_entry(&self, id: i64) -> VhdStoreResult<()> {
        self.txn.execute("DELETE FROM journal WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Register every leaf in `leaves` as needing a datapath refresh once
    /// `vhd_id` finishes reparenting.
    pub fn add_refresh_entries(&self, vhd_id: i64, leaves: &[i64]) -> VhdStoreResult<Vec<Refresh>> {
        let mut out = Vec::with_capacity(leaves.len());
        for &leaf_id in leaves {
            self.txn.execute(
                "INSERT OR IGNORE INTO refresh (vhd_id, leaf_id) VALUES (?1, ?2)",
                params![vhd_id, leaf_id],
            )?;
            out.push(Refresh { vhd_id, leaf_id });
        }
        Ok(out)
    }

    pub fn remove_refresh_entry(&self, leaf_id: i64) -> VhdStoreResult<()> {
        self.txn
            .execute("DELETE FROM refresh WHERE leaf_id = ?1", params![leaf_id])?;
        Ok(())
    }

    /// Read a single VHD row inside the current transaction (used by
    /// recovery/engine code that needs a consistent view mid-transaction).
    pub fn get_vhd_by_id(&self, id: i64) -> VhdStoreResult<Option<Vhd>> {
        self.txn
            .query_row("SELECT * FROM vhd WHERE id = ?1", params![id], Vhd::from_row)
            .optional()
            .map_err(Into::into)
    }
}
