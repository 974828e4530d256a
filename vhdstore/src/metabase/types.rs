//! Row types for the four metabase tables, one `from_row` constructor per
//! `SELECT`.

use rusqlite::Row;

/// A physical chain node: one VHD file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vhd {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub snap: i64,
    /// Virtual size in bytes. `None` only transiently, between the two
    /// write transactions of a resize.
    pub vsize: Option<i64>,
    pub psize: Option<i64>,
}

impl Vhd {
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            snap: row.get("snap")?,
            vsize: row.get("vsize")?,
            psize: row.get("psize")?,
        })
    }
}

/// A logical disk, currently pointing at exactly one leaf VHD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vdi {
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub active_on: Option<String>,
    pub nonpersistent: bool,
    pub vhd_id: i64,
}

impl Vdi {
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get("uuid")?,
            name: row.get("name")?,
            description: row.get("description")?,
            active_on: row.get("active_on")?,
            nonpersistent: row.get::<_, i64>("nonpersistent")? != 0,
            vhd_id: row.get("vhd_id")?,
        })
    }
}

/// A grandchild mid-reparent: written before the on-disk parent pointer is
/// rewritten, removed once both the file and the metabase agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Journal {
    pub id: i64,
    pub parent_id: i64,
    pub new_parent_id: i64,
}

impl Journal {
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            new_parent_id: row.get("new_parent_id")?,
        })
    }
}

/// One leaf whose datapath tap must be refreshed after `vhd_id` is
/// reparented beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refresh {
    pub vhd_id: i64,
    pub leaf_id: i64,
}

impl Refresh {
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            vhd_id: row.get("vhd_id")?,
            leaf_id: row.get("leaf_id")?,
        })
    }
}
