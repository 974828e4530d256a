//! The transactional catalogue of VHDs and VDIs for one storage
//! repository: one embedded relational store file, one connection, every
//! mutation serialized through [`WriteContext`].

mod schema;
mod types;
mod write_context;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use vhdstore_shared::{VhdStoreError, VhdStoreResult};

pub use types::{Journal, Refresh, Vdi, Vhd};
pub use write_context::WriteContext;

/// Cross-host contention on the shared store can legitimately run for a
/// long time (another host's coalesce, a stuck clone); operators can
/// raise this towards an hour-scale ceiling if contention demands it.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(100);

pub struct Metabase {
    conn: Connection,
}

impl Metabase {
    /// Open (or create) the metabase file at `path` and ensure its schema
    /// exists. Safe to call repeatedly: schema creation is idempotent and
    /// guarded by a `schema_version` row.
    pub fn open(path: &Path, busy_timeout: Duration) -> VhdStoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout={};",
            busy_timeout.as_millis()
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> VhdStoreResult<()> {
        for sql in schema::all_schemas() {
            conn.execute_batch(sql)?;
        }
        for sql in schema::all_indexes() {
            conn.execute_batch(sql)?;
        }

        let current_version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    params![schema::SCHEMA_VERSION, now],
                )?;
                tracing::info!(version = schema::SCHEMA_VERSION, "initialized metabase schema");
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                tracing::warn!(found = v, current = schema::SCHEMA_VERSION, "metabase schema older than binary; no migration applied");
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(VhdStoreError::Database(format!(
                    "metabase schema version {v} is newer than this binary supports ({})",
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }

    /// Begin a scoped write transaction. Borrows `self` mutably, so a
    /// second call while the first `WriteContext` is still alive is a
    /// compile error rather than a runtime one.
    pub fn write_context(&mut self) -> VhdStoreResult<WriteContext<'_>> {
        let txn = self.conn.transaction()?;
        Ok(WriteContext::new(txn))
    }

    pub fn get_vdi_by_uuid(&self, uuid: &str) -> VhdStoreResult<Option<Vdi>> {
        self.conn
            .query_row("SELECT * FROM vdi WHERE uuid = ?1", params![uuid], Vdi::from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_vdi_for_vhd(&self, vhd_id: i64) -> VhdStoreResult<Option<Vdi>> {
        self.conn
            .query_row("SELECT * FROM vdi WHERE vhd_id = ?1", params![vhd_id], Vdi::from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_all_vdis(&self) -> VhdStoreResult<Vec<Vdi>> {
        let mut stmt = self.conn.prepare("SELECT * FROM vdi ORDER BY uuid")?;
        let rows = stmt.query_map([], Vdi::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_vhd_by_id(&self, id: i64) -> VhdStoreResult<Option<Vhd>> {
        self.conn
            .query_row("SELECT * FROM vhd WHERE id = ?1", params![id], Vhd::from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_children(&self, vhd_id: i64) -> VhdStoreResult<Vec<Vhd>> {
        let mut stmt = self.conn.prepare("SELECT * FROM vhd WHERE parent_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![vhd_id], Vhd::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Interior nodes that are the unique child of their parent and
    /// themselves have at least one child: collapsing them loses no data
    /// and strictly shortens the chain.
    pub fn find_non_leaf_coalesceable(&self) -> VhdStoreResult<Vec<Vhd>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.* FROM vhd v
             WHERE v.parent_id IS NOT NULL
               AND (SELECT COUNT(*) FROM vhd s WHERE s.parent_id = v.parent_id) = 1
               AND (SELECT COUNT(*) FROM vhd c WHERE c.parent_id = v.id) >= 1
             ORDER BY v.id",
        )?;
        let rows = stmt.query_map([], Vhd::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Same shape as [`Self::find_non_leaf_coalesceable`] but for leaves
    /// (no children). Kept as a query for future use; no operation in
    /// this crate invokes it — leaf coalesce is not part of the GC loop.
    pub fn find_leaf_coalesceable(&self) -> VhdStoreResult<Vec<Vhd>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.* FROM vhd v
             WHERE v.parent_id IS NOT NULL
               AND (SELECT COUNT(*) FROM vhd s WHERE s.parent_id = v.parent_id) = 1
               AND (SELECT COUNT(*) FROM vhd c WHERE c.parent_id = v.id) = 0
             ORDER BY v.id",
        )?;
        let rows = stmt.query_map([], Vhd::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// VHDs with no children and no referencing VDI: safe to delete
    /// outright, the result of a crashed destroy or a completed coalesce.
    pub fn get_garbage_vhds(&self) -> VhdStoreResult<Vec<Vhd>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.* FROM vhd v
             WHERE NOT EXISTS (SELECT 1 FROM vhd c WHERE c.parent_id = v.id)
               AND NOT EXISTS (SELECT 1 FROM vdi d WHERE d.vhd_id = v.id)
             ORDER BY v.id",
        )?;
        let rows = stmt.query_map([], Vhd::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Leaves (VHDs with no children) whose ancestor chain passes through
    /// `vhd_id`, inclusive, restricted to those a VDI actually references
    /// (the coalesce daemon only needs to refresh live taps).
    pub fn find_live_leaves_under(&self, vhd_id: i64) -> VhdStoreResult<Vec<Vhd>> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE descendants(id) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT v.id FROM vhd v JOIN descendants d ON v.parent_id = d.id
             )
             SELECT v.* FROM vhd v
             WHERE v.id IN (SELECT id FROM descendants)
               AND NOT EXISTS (SELECT 1 FROM vhd c WHERE c.parent_id = v.id)
               AND EXISTS (SELECT 1 FROM vdi d WHERE d.vhd_id = v.id)
             ORDER BY v.id",
        )?;
        let rows = stmt.query_map(params![vhd_id], Vhd::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_journal_entries(&self) -> VhdStoreResult<Vec<Journal>> {
        let mut stmt = self.conn.prepare("SELECT * FROM journal ORDER BY id")?;
        let rows = stmt.query_map([], Journal::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_refresh_entries(&self) -> VhdStoreResult<Vec<Refresh>> {
        let mut stmt = self.conn.prepare("SELECT * FROM refresh ORDER BY vhd_id, leaf_id")?;
        let rows = stmt.query_map([], Refresh::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Sum of `psize` across every non-leaf VHD: the capacity a coalesce
    /// pass would eventually free, useful for SR-level capacity reporting.
    pub fn get_non_leaf_total_psize(&self) -> VhdStoreResult<i64> {
        let total: Option<i64> = self.conn.query_row(
            "SELECT SUM(v.psize) FROM vhd v
             WHERE EXISTS (SELECT 1 FROM vhd c WHERE c.parent_id = v.id)",
            [],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }
}
