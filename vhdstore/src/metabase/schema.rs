//! Schema DDL, created idempotently and guarded by a version row.

pub const SCHEMA_VERSION: i32 = 1;

pub fn all_schemas() -> [&'static str; 5] {
    [
        "CREATE TABLE IF NOT EXISTS vhd (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_id INTEGER REFERENCES vhd(id),
            snap      INTEGER NOT NULL DEFAULT 0,
            vsize     INTEGER,
            psize     INTEGER
        );",
        "CREATE TABLE IF NOT EXISTS vdi (
            uuid          TEXT PRIMARY KEY,
            name          TEXT NOT NULL DEFAULT '',
            description   TEXT NOT NULL DEFAULT '',
            active_on     TEXT,
            nonpersistent INTEGER NOT NULL DEFAULT 0,
            vhd_id        INTEGER NOT NULL UNIQUE REFERENCES vhd(id)
        );",
        "CREATE TABLE IF NOT EXISTS journal (
            id            INTEGER PRIMARY KEY REFERENCES vhd(id),
            parent_id     INTEGER NOT NULL,
            new_parent_id INTEGER NOT NULL
        );",
        "CREATE TABLE IF NOT EXISTS refresh (
            vhd_id  INTEGER NOT NULL,
            leaf_id INTEGER NOT NULL,
            PRIMARY KEY (vhd_id, leaf_id)
        );",
        "CREATE TABLE IF NOT EXISTS schema_version (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            version    INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    ]
}

pub fn all_indexes() -> [&'static str; 2] {
    [
        "CREATE INDEX IF NOT EXISTS idx_vhd_parent_id ON vhd(parent_id);",
        "CREATE INDEX IF NOT EXISTS idx_vdi_vhd_id ON vdi(vhd_id);",
    ]
}
